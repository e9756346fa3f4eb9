use crate::types::{
    AcquisitionWindow, GlacierError, GlacierResult, OrbitPairSignature, Orientation,
    RelativeOrbit, SceneInfo, Source, TrackClass,
};
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Separator between the two scene names of a raw field
pub const SCENE_SEPARATOR: &str = "__";

fn sentinel2_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(S2[AB])_MSIL2A_(\d{8}T\d{6})_N(\d{4})_R(\d{3})(?:_[A-Za-z0-9_]*)?$")
            .expect("static Sentinel-2 pattern")
    })
}

fn landsat_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(LC0[89])_([A-Z0-9]{4})_(\d{6})_(\d{8})_(\d{8})_(\d{2})_([A-Z0-9]{2})$")
            .expect("static Landsat pattern")
    })
}

/// Parsed raw-field name: both scenes plus the source they come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldIdentifier {
    pub name: String,
    pub source: Source,
    pub scene1: SceneInfo,
    pub scene2: SceneInfo,
}

impl FieldIdentifier {
    /// Parse a name, detecting the source from its prefix
    pub fn parse(name: &str) -> GlacierResult<Self> {
        let source = if name.starts_with("S2") {
            Source::Sentinel2
        } else if name.starts_with("LC0") {
            Source::Landsat
        } else {
            return Err(malformed(name, "unknown sensor prefix"));
        };
        Self::parse_for(source, name)
    }

    /// Parse a name that must belong to `source`
    pub fn parse_for(source: Source, name: &str) -> GlacierResult<Self> {
        let parts: Vec<&str> = name.split(SCENE_SEPARATOR).collect();
        if parts.len() != 2 {
            return Err(malformed(name, "expected two scene names joined by '__'"));
        }
        let scene1 = parse_scene(source, name, parts[0])?;
        let scene2 = parse_scene(source, name, parts[1])?;
        if scene1.datetime >= scene2.datetime {
            return Err(malformed(name, "first scene is not earlier than second scene"));
        }
        Ok(Self {
            name: name.to_string(),
            source,
            scene1,
            scene2,
        })
    }

    pub fn window(&self) -> AcquisitionWindow {
        AcquisitionWindow {
            start: self.scene1.datetime,
            end: self.scene2.datetime,
        }
    }

    pub fn track_class(&self) -> TrackClass {
        TrackClass::classify(&self.scene1.orbit, &self.scene2.orbit)
    }

    pub fn signature(&self) -> (OrbitPairSignature, Orientation) {
        OrbitPairSignature::canonical(self.source, &self.scene1.orbit, &self.scene2.orbit)
    }
}

fn malformed(name: &str, reason: &str) -> GlacierError {
    GlacierError::MalformedIdentifier {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_scene(source: Source, full: &str, scene: &str) -> GlacierResult<SceneInfo> {
    match source {
        Source::Sentinel2 => {
            let caps = sentinel2_pattern()
                .captures(scene)
                .ok_or_else(|| {
                    malformed(full, &format!("'{}' is not a Sentinel-2 L2A scene", scene))
                })?;
            let naive = NaiveDateTime::parse_from_str(&caps[2], "%Y%m%dT%H%M%S")
                .map_err(|e| malformed(full, &format!("bad sensing time: {}", e)))?;
            Ok(SceneInfo {
                satellite: caps[1].to_string(),
                datetime: Utc.from_utc_datetime(&naive),
                orbit: RelativeOrbit(caps[4].to_string()),
                processing_version: format!("N{}", &caps[3]),
            })
        }
        Source::Landsat => {
            let caps = landsat_pattern()
                .captures(scene)
                .ok_or_else(|| malformed(full, &format!("'{}' is not a Landsat scene id", scene)))?;
            let date = NaiveDate::parse_from_str(&caps[4], "%Y%m%d")
                .map_err(|e| malformed(full, &format!("bad acquisition date: {}", e)))?;
            let naive = date
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| malformed(full, "bad acquisition date"))?;
            Ok(SceneInfo {
                satellite: caps[1].to_string(),
                datetime: Utc.from_utc_datetime(&naive),
                orbit: RelativeOrbit(caps[3].to_string()),
                processing_version: format!("C{}_{}_{}", &caps[6], &caps[7], &caps[2]),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S2_CROSS: &str =
        "S2A_MSIL2A_20200716T162839_N0214_R083__S2B_MSIL2A_20200726T162839_N0214_R040";
    const L8_SAME: &str =
        "LC08_L1TP_008011_20200716_20200722_02_T1__LC08_L1TP_008011_20200801_20200807_02_T1";

    #[test]
    fn test_parse_sentinel2() {
        let id = FieldIdentifier::parse(S2_CROSS).unwrap();
        assert_eq!(id.source, Source::Sentinel2);
        assert_eq!(id.scene1.satellite, "S2A");
        assert_eq!(id.scene2.orbit, RelativeOrbit("040".into()));
        assert_eq!(id.scene1.processing_version, "N0214");
        assert_eq!(id.track_class(), TrackClass::CrossTrack);
        assert_eq!(id.window().baseline_days(), 10.0);
        let (sig, orientation) = id.signature();
        assert_eq!(sig.token(), "R040_R083");
        assert_eq!(orientation, Orientation::Reversed);
    }

    #[test]
    fn test_parse_sentinel2_with_tile_suffix() {
        let name = concat!(
            "S2A_MSIL2A_20200716T162839_N0214_R083_T22WEV__",
            "S2A_MSIL2A_20200726T162839_N0214_R083_T22WEV"
        );
        let id = FieldIdentifier::parse(name).unwrap();
        assert_eq!(id.track_class(), TrackClass::SameTrack);
    }

    #[test]
    fn test_parse_landsat() {
        let id = FieldIdentifier::parse(L8_SAME).unwrap();
        assert_eq!(id.source, Source::Landsat);
        assert_eq!(id.scene1.orbit, RelativeOrbit("008011".into()));
        assert_eq!(id.scene1.processing_version, "C02_T1_L1TP");
        assert_eq!(id.track_class(), TrackClass::SameTrack);
        assert_eq!(id.window().baseline_days(), 16.0);
    }

    #[test]
    fn test_rejects_malformed_names() {
        for name in [
            "garbage",
            "S2A_MSIL2A_20200716T162839_N0214_R083",
            "S2A_MSIL2A_20200726T162839_N0214_R083__S2B_MSIL2A_20200716T162839_N0214_R040",
            "S2A_MSIL2A_2020071xT162839_N0214_R083__S2B_MSIL2A_20200726T162839_N0214_R040",
            "LC08_L1TP_008011_20201316_20200722_02_T1__LC08_L1TP_008011_20200801_20200807_02_T1",
        ] {
            assert!(
                matches!(
                    FieldIdentifier::parse(name),
                    Err(GlacierError::MalformedIdentifier { .. })
                ),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_source_mismatch_is_malformed() {
        assert!(FieldIdentifier::parse_for(Source::Landsat, S2_CROSS).is_err());
    }
}
