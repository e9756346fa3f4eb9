//! Per-field offset correction, masking, filtering and uncertainty propagation.

use crate::config::{CorrectionConfig, CoverageFilter, ProjectInfo};
use crate::core::offset_estimation::{OffsetEstimate, OffsetField, ReferenceField};
use crate::core::statistics;
use crate::io::container::StepRecord;
use crate::io::field_store::RawField;
use crate::io::masks::{MaskCache, MaskSet};
use crate::io::preview;
use crate::io::raster::RasterIo;
use crate::io::workspace::{commit_bytes, commit_with, UnitWorkspace};
use crate::types::{
    ErrorStatistics, GlacierResult, GridSpec, OrbitPairRecord, OrbitPairSignature,
    Orientation, Period, QualityFlag, Raster, Source,
};
use chrono::Utc;
use ndarray::Zip;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;

/// Raw field after correction and masking, metres/day
#[derive(Debug, Clone)]
pub struct CorrectedField {
    pub record: OrbitPairRecord,
    pub period: Period,
    pub vx: Raster,
    pub vy: Raster,
    pub ux: Raster,
    pub uy: Raster,
    pub grid: GridSpec,
    pub error: ErrorStatistics,
    /// Valid ice pixels / ice pixels
    pub ice_coverage: f64,
    pub quality_flags: Vec<QualityFlag>,
    /// Offset subtracted from the field, with the orientation it was applied with
    pub offset: Option<(OrbitPairSignature, Orientation)>,
}

impl CorrectedField {
    pub fn source(&self) -> Source {
        self.record.source
    }

    pub fn vv(&self) -> Raster {
        statistics::magnitude(&self.vx, &self.vy)
    }

    pub fn step_record(&self) -> StepRecord {
        StepRecord {
            field_id: self.record.field_id.clone(),
            source: self.record.source,
            period: self.period,
            scene_1_datetime: self.record.datetime_1,
            scene_2_datetime: self.record.datetime_2,
            satellite_1: self.record.satellite_1.clone(),
            satellite_2: self.record.satellite_2.clone(),
            orbit_1: self.record.orbit_1.clone(),
            orbit_2: self.record.orbit_2.clone(),
            processing_version: self.record.processing_1.clone(),
            offset_signature: self.offset.as_ref().map(|(sig, _)| sig.token()),
            baseline_days: self.record.baseline_days,
            ice_coverage: self.ice_coverage,
            error: self.error,
            quality_flags: self.quality_flags.clone(),
        }
    }

    /// Metadata record written next to the corrected rasters
    pub fn metadata(&self, unit: &str, project: &ProjectInfo) -> serde_json::Value {
        let finite = |v: f64| if v.is_finite() { json!(v) } else { serde_json::Value::Null };
        let stats = |e: &ErrorStatistics| {
            json!({
                "mean_vx": finite(e.mean_vx),
                "std_vx": finite(e.std_vx),
                "mean_vy": finite(e.mean_vy),
                "std_vy": finite(e.std_vy),
                "rmse_vv": finite(e.rmse_vv),
                "rock_pixels": e.rock_pixels,
            })
        };
        let mean_finite = |r: &Raster| {
            let values: Vec<f64> = r.iter().filter(|v| v.is_finite()).map(|v| *v as f64).collect();
            if values.is_empty() {
                serde_json::Value::Null
            } else {
                json!(values.iter().sum::<f64>() / values.len() as f64)
            }
        };
        let bbox = self.grid.bounding_box();
        json!({
            "unit": unit,
            "field_id": self.record.field_id,
            "source": self.record.source,
            "period": self.period,
            "acquisition": {
                "scene_1_datetime": self.record.datetime_1.to_rfc3339(),
                "scene_2_datetime": self.record.datetime_2.to_rfc3339(),
                "midpoint_datetime": self.record.midpoint.to_rfc3339(),
                "baseline_days": self.record.baseline_days,
                "satellites": [self.record.satellite_1, self.record.satellite_2],
                "relative_orbits": [self.record.orbit_1, self.record.orbit_2],
                "processing_baselines": [self.record.processing_1, self.record.processing_2],
                "classification": self.record.classification,
            },
            "error_statistics": {
                "velocity_m_per_day": stats(&self.error),
                "displacement_m": stats(&self.error.to_displacement(self.record.baseline_days)),
            },
            "uncertainty": {
                "mean_ux": mean_finite(&self.ux),
                "mean_uy": mean_finite(&self.uy),
                "units": "m/d",
            },
            "mask_coverage": {
                "ice_coverage": self.ice_coverage,
                "percent_ice_area_notnull": self.ice_coverage * 100.0,
            },
            "quality_flags": self.quality_flags,
            "lineage": {
                "raw_field": self.record.field_id,
                "offset_signature": self.offset.as_ref().map(|(sig, _)| sig.token()),
                "orientation": self.offset.as_ref().map(|(_, o)| format!("{:?}", o)),
            },
            "geospatial": {
                "epsg": self.grid.epsg,
                "geo_transform": self.grid.geo_transform.to_gdal(),
                "rows": self.grid.rows,
                "cols": self.grid.cols,
                "bounding_box": bbox,
            },
            "project": project,
            "date_created": Utc::now().to_rfc3339(),
        })
    }
}

/// Why a field did not produce a corrected output
#[derive(Debug, Clone, PartialEq)]
pub enum Exclusion {
    /// Cross-track field whose signature has no offset
    Uncorrectable(OrbitPairSignature),
    MaskResample(String),
    GridMismatch(String),
    LowCoverage(f64),
    NotLoaded(String),
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exclusion::Uncorrectable(sig) => write!(f, "uncorrectable: no offset for {}", sig),
            Exclusion::MaskResample(e) => write!(f, "mask resampling failed: {}", e),
            Exclusion::GridMismatch(e) => write!(f, "grid mismatch: {}", e),
            Exclusion::LowCoverage(c) => write!(f, "ice coverage {:.4} below threshold", c),
            Exclusion::NotLoaded(e) => write!(f, "not loaded: {}", e),
        }
    }
}

/// Corrected fields of one unit and period plus what was left out
#[derive(Debug, Clone, Default)]
pub struct CorrectionSummary {
    pub corrected: Vec<CorrectedField>,
    pub excluded: Vec<(String, Exclusion)>,
}

impl CorrectionSummary {
    pub fn for_source(&self, source: Source) -> Vec<CorrectedField> {
        self.corrected
            .iter()
            .filter(|f| f.source() == source)
            .cloned()
            .collect()
    }

    pub fn excluded_count(&self) -> usize {
        self.excluded.len()
    }
}

/// Field corrector
pub struct FieldCorrector;

impl FieldCorrector {
    /// Correct one field with an optional offset against masks on its grid
    pub fn correct_field(
        field: &RawField,
        record: &OrbitPairRecord,
        period: Period,
        offset: Option<(&OffsetField, Orientation)>,
        reference: Option<&ReferenceField>,
        masks: &MaskSet,
        config: &CorrectionConfig,
    ) -> Result<CorrectedField, Exclusion> {
        let shape = field.grid.shape();
        if masks.ice.dim() != shape {
            return Err(Exclusion::MaskResample(format!(
                "masks are {:?}, field is {:?}",
                masks.ice.dim(),
                shape
            )));
        }
        let baseline = record.baseline_days as f32;
        let mut vx = field.dx.clone();
        let mut vy = field.dy.clone();

        if let Some((offset, orientation)) = offset {
            if offset.dx.dim() != shape {
                return Err(Exclusion::GridMismatch(format!(
                    "offset {} is {:?}, field is {:?}",
                    offset.signature,
                    offset.dx.dim(),
                    shape
                )));
            }
            let sign = orientation.sign();
            Zip::from(&mut vx)
                .and(&offset.dx)
                .for_each(|v, o| *v -= sign * o / baseline);
            Zip::from(&mut vy)
                .and(&offset.dy)
                .for_each(|v, o| *v -= sign * o / baseline);
        }

        // The field's own validity mask
        if let Some(validity) = &field.validity {
            Zip::from(&mut vx)
                .and(&mut vy)
                .and(validity)
                .for_each(|x, y, m| {
                    if *m == 0 {
                        *x = f32::NAN;
                        *y = f32::NAN;
                    }
                });
        }

        // A pixel is valid only when both components are
        Zip::from(&mut vx).and(&mut vy).for_each(|x, y| {
            if !x.is_finite() || !y.is_finite() {
                *x = f32::NAN;
                *y = f32::NAN;
            }
        });

        let vx_stats = statistics::masked_stats(&vx, &masks.rock);
        let vy_stats = statistics::masked_stats(&vy, &masks.rock);
        let vv_stats = statistics::masked_stats(&statistics::magnitude(&vx, &vy), &masks.rock);
        let error = ErrorStatistics {
            mean_vx: vx_stats.mean,
            std_vx: vx_stats.std,
            mean_vy: vy_stats.mean,
            std_vy: vy_stats.std,
            rmse_vv: vv_stats.rmse,
            rock_pixels: vv_stats.count,
        };

        let glacier = Zip::from(&masks.ice)
            .and(&masks.ocean)
            .map_collect(|i, o| u8::from(*i != 0 && *o == 0));
        let initially_valid = statistics::count_valid(&vx, &glacier);

        if config.flow_filter {
            if let Some(reference) = reference.filter(|r| r.flow_direction.dim() == shape) {
                let limit = config.max_flow_deviation_deg;
                Zip::from(&mut vx)
                    .and(&mut vy)
                    .and(&reference.flow_direction)
                    .and(&glacier)
                    .for_each(|x, y, dir, g| {
                        if *g == 0 || !x.is_finite() || !dir.is_finite() {
                            return;
                        }
                        let angle = y.atan2(*x).to_degrees();
                        if statistics::angular_difference(angle, *dir) > limit {
                            *x = f32::NAN;
                            *y = f32::NAN;
                        }
                    });
            }
        }

        Zip::from(&mut vx)
            .and(&mut vy)
            .and(&glacier)
            .for_each(|x, y, g| {
                if *g == 0 {
                    *x = f32::NAN;
                    *y = f32::NAN;
                }
            });

        let ice_pixels = glacier.iter().filter(|g| **g != 0).count();
        let valid = statistics::count_valid(&vx, &glacier);
        let ice_coverage = if ice_pixels == 0 {
            0.0
        } else {
            valid as f64 / ice_pixels as f64
        };
        let filtered = config.coverage_filter == CoverageFilter::Enabled;
        if filtered && ice_coverage < config.min_ice_coverage {
            return Err(Exclusion::LowCoverage(ice_coverage));
        }

        let sd_or_zero = |sd: f64| if sd.is_finite() { sd as f32 } else { 0.0 };
        let (sd_x, sd_y) = (sd_or_zero(error.std_vx), sd_or_zero(error.std_vy));
        let scale = config.mad_scale / baseline;
        let propagate = |v: &Raster, sd: f32, mad: Option<&Raster>| -> Raster {
            match mad {
                Some(mad) => Zip::from(v).and(mad).map_collect(|v, m| {
                    if v.is_finite() {
                        (sd * sd + (scale * m).powi(2)).sqrt()
                    } else {
                        f32::NAN
                    }
                }),
                None => v.mapv(|v| if v.is_finite() { sd } else { f32::NAN }),
            }
        };
        let ux = propagate(&vx, sd_x, offset.map(|(o, _)| &o.mad_dx));
        let uy = propagate(&vy, sd_y, offset.map(|(o, _)| &o.mad_dy));

        let mut quality_flags = Vec::new();
        if ice_coverage < config.low_coverage_threshold {
            quality_flags.push(QualityFlag::LowCoverage);
        }
        if initially_valid > 0 {
            let removed = initially_valid.saturating_sub(valid) as f64 / initially_valid as f64;
            if removed > config.masked_excess_fraction {
                quality_flags.push(QualityFlag::MaskedExcess);
            }
        }

        Ok(CorrectedField {
            record: record.clone(),
            period,
            vx,
            vy,
            ux,
            uy,
            grid: field.grid.clone(),
            error,
            ice_coverage,
            quality_flags,
            offset: offset.map(|(o, orientation)| (o.signature.clone(), orientation)),
        })
    }

    /// Correct every selected record of a period.
    ///
    /// Individual fields are skipped and logged, never fatal.
    pub fn run(
        records: &[&OrbitPairRecord],
        fields: &BTreeMap<String, RawField>,
        estimate: &OffsetEstimate,
        masks: &mut MaskCache,
        period: Period,
        config: &CorrectionConfig,
        correction_enabled: &dyn Fn(Source) -> bool,
    ) -> CorrectionSummary {
        log::info!("🧊 Correcting {} fields ({})", records.len(), period);
        let reference = estimate.reference.as_deref();
        let mut summary = CorrectionSummary::default();

        for record in records {
            let Some(field) = fields.get(&record.field_id) else {
                summary.excluded.push((
                    record.field_id.clone(),
                    Exclusion::NotLoaded("raw field could not be read".to_string()),
                ));
                continue;
            };

            let offset = if record.is_same_track() || !correction_enabled(record.source) {
                None
            } else {
                let (signature, orientation) = record.signature();
                match estimate.offset_for(&signature) {
                    Some(offset) => Some((offset, orientation)),
                    None => {
                        log::warn!(
                            "   {} uncorrectable: no offset for {}",
                            record.field_id,
                            signature
                        );
                        summary
                            .excluded
                            .push((record.field_id.clone(), Exclusion::Uncorrectable(signature)));
                        continue;
                    }
                }
            };

            let field_masks = match masks.for_grid(&field.grid) {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("   {} skipped: {}", record.field_id, e);
                    summary
                        .excluded
                        .push((record.field_id.clone(), Exclusion::MaskResample(e.to_string())));
                    continue;
                }
            };

            let source_reference = reference.filter(|_| correction_enabled(record.source));
            let result = Self::correct_field(
                field,
                record,
                period,
                offset,
                source_reference,
                &field_masks,
                config,
            );
            match result {
                Ok(corrected) => summary.corrected.push(corrected),
                Err(reason) => {
                    log::warn!("   {} excluded: {}", record.field_id, reason);
                    summary.excluded.push((record.field_id.clone(), reason));
                }
            }
        }

        log::info!(
            "   {} corrected, {} excluded",
            summary.corrected.len(),
            summary.excluded.len()
        );
        summary
    }

    /// Write `vx`, `vy`, `vv` GeoTIFFs, the metadata record and a magnitude preview
    pub fn persist(
        field: &CorrectedField,
        unit: &str,
        workspace: &UnitWorkspace,
        project: &ProjectInfo,
        previews: bool,
    ) -> GlacierResult<()> {
        let id = &field.record.field_id;
        let dir = workspace.field_dir(id)?;
        let vv = field.vv();
        for (suffix, raster) in [("vx", &field.vx), ("vy", &field.vy), ("vv", &vv)] {
            let path = dir.join(format!("{}_{}.tif", id, suffix));
            commit_with(&path, |tmp| RasterIo::write_f32(tmp, raster, &field.grid))?;
        }
        let metadata = serde_json::to_vec_pretty(&field.metadata(unit, project))?;
        commit_bytes(&dir.join(format!("{}_metadata.json", id)), &metadata)?;
        if previews {
            preview::write_png(&dir.join(format!("{}_vv.png", id)), &vv)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::orbit_index::OrbitIndexer;
    use crate::io::identifier::FieldIdentifier;
    use crate::types::GeoTransform;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    const SAME: &str =
        "S2A_MSIL2A_20200701T120000_N0214_R083__S2A_MSIL2A_20200711T120000_N0214_R083";
    const CROSS: &str =
        "S2A_MSIL2A_20200701T120000_N0214_R083__S2B_MSIL2A_20200711T120000_N0214_R040";

    fn grid() -> GridSpec {
        GridSpec {
            geo_transform: GeoTransform::from_gdal([0.0, 100.0, 0.0, 0.0, 0.0, -100.0]),
            rows: 2,
            cols: 2,
            epsg: 3413,
        }
    }

    // Ice on the left column, rock on the right
    fn masks() -> MaskSet {
        MaskSet::from_ice_ocean(array![[1u8, 0], [1, 0]], array![[0u8, 0], [0, 0]], grid()).unwrap()
    }

    fn raw(name: &str, dx: Raster, dy: Raster) -> (RawField, OrbitPairRecord) {
        let id = FieldIdentifier::parse(name).unwrap();
        let record = OrbitIndexer::record_for(&id);
        (RawField::new(id, dx, dy, grid()).unwrap(), record)
    }

    fn offset(dx: f32, mad: f32) -> OffsetField {
        OffsetField {
            signature: OrbitPairSignature::canonical(
                Source::Sentinel2,
                &crate::types::RelativeOrbit("040".into()),
                &crate::types::RelativeOrbit("083".into()),
            )
            .0,
            dx: Array2::from_elem((2, 2), dx),
            dy: Array2::zeros((2, 2)),
            mad_dx: Array2::from_elem((2, 2), mad),
            mad_dy: Array2::zeros((2, 2)),
            members: vec![],
            grid: grid(),
        }
    }

    fn apply(
        field: &RawField,
        record: &OrbitPairRecord,
        offset: Option<(&OffsetField, Orientation)>,
        reference: Option<&ReferenceField>,
        cfg: &CorrectionConfig,
    ) -> Result<CorrectedField, Exclusion> {
        let period = Period::Whole;
        FieldCorrector::correct_field(field, record, period, offset, reference, &masks(), cfg)
    }

    fn config() -> CorrectionConfig {
        CorrectionConfig {
            flow_filter: false,
            ..CorrectionConfig::default()
        }
    }

    #[test]
    fn test_offset_applied_with_orientation_and_baseline() {
        let dx = Array2::from_elem((2, 2), 3.0);
        let (field, record) = raw(CROSS, dx, Array2::from_elem((2, 2), 1.0));
        let off = offset(10.0, 0.0);
        // Scene orbits 083 -> 040 are reversed relative to R040_R083
        let reversed = Some((&off, Orientation::Reversed));
        let corrected = apply(&field, &record, reversed, None, &config()).unwrap();
        assert_relative_eq!(corrected.vx[[0, 0]], 4.0);
        assert!(corrected.vx[[0, 1]].is_nan(), "rock pixels are outside the ice mask");
        assert_relative_eq!(corrected.error.mean_vx, 4.0);
        assert_eq!(corrected.offset.as_ref().unwrap().1, Orientation::Reversed);
    }

    #[test]
    fn test_zero_offset_matches_masking_only() {
        let dx = array![[1.0f32, 2.0], [f32::NAN, 4.0]];
        let (field, record) = raw(SAME, dx.clone(), dx);
        let zero = offset(0.0, 0.0);
        let masked = apply(&field, &record, None, None, &config()).unwrap();
        let forward = Some((&zero, Orientation::Forward));
        let zeroed = apply(&field, &record, forward, None, &config()).unwrap();
        for (a, b) in masked.vx.iter().zip(zeroed.vx.iter()) {
            assert!(a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan()));
        }
    }

    #[test]
    fn test_uncertainty_combines_rock_sd_and_mad() {
        let dx = array![[1.0f32, 1.0], [1.0, 3.0]];
        let (field, record) = raw(CROSS, dx, Array2::zeros((2, 2)));
        let off = offset(0.0, 10.0);
        let reversed = Some((&off, Orientation::Reversed));
        let corrected = apply(&field, &record, reversed, None, &config()).unwrap();
        // Rock vx = [1, 3]: sd 1; MAD term 1.4826 * 10 / 10
        let expected = (1.0f32 + 1.4826f32.powi(2)).sqrt();
        assert_relative_eq!(corrected.ux[[0, 0]], expected, epsilon = 1e-5);
        assert!(corrected.ux[[0, 1]].is_nan());
    }

    #[test]
    fn test_coverage_filter_and_flags() {
        let dx = array![[f32::NAN, 1.0], [1.0, 1.0]];
        let (field, record) = raw(SAME, dx.clone(), dx);
        let result = apply(&field, &record, None, None, &config()).unwrap();
        assert_relative_eq!(result.ice_coverage, 0.5);
        assert!(result.quality_flags.is_empty());

        let strict = CorrectionConfig {
            min_ice_coverage: 0.75,
            ..config()
        };
        let excluded = apply(&field, &record, None, None, &strict);
        assert_eq!(excluded.unwrap_err(), Exclusion::LowCoverage(0.5));

        let disabled = CorrectionConfig {
            coverage_filter: CoverageFilter::Disabled,
            ..strict
        };
        assert!(apply(&field, &record, None, None, &disabled).is_ok());
    }

    #[test]
    fn test_flow_filter_invalidates_deviating_pixels() {
        // Ice pixel (0,0) flows along +x, (1,0) along +y
        let dx = array![[1.0f32, 0.0], [0.0, 0.0]];
        let dy = array![[0.0f32, 0.0], [1.0, 0.0]];
        let (field, record) = raw(SAME, dx, dy);
        let reference = ReferenceField {
            dx: Array2::zeros((2, 2)),
            dy: Array2::zeros((2, 2)),
            dmag: Array2::zeros((2, 2)),
            flow_direction: Array2::zeros((2, 2)),
            counts: Array2::zeros((2, 2)),
            grid: grid(),
            members: 5,
        };
        let cfg = CorrectionConfig::default();
        let corrected = apply(&field, &record, None, Some(&reference), &cfg).unwrap();
        assert_eq!(corrected.vx[[0, 0]], 1.0);
        assert!(corrected.vx[[1, 0]].is_nan());
        assert!(!corrected.quality_flags.contains(&QualityFlag::LowCoverage));
        assert_relative_eq!(corrected.ice_coverage, 0.5);
    }

    #[test]
    fn test_masked_excess_flag() {
        let dx = array![[1.0f32, 0.0], [0.0, 0.0]];
        let dy = array![[0.0f32, 0.0], [-1.0, 0.0]];
        let (field, record) = raw(SAME, dx, dy);
        let reference = ReferenceField {
            dx: Array2::zeros((2, 2)),
            dy: Array2::zeros((2, 2)),
            dmag: Array2::zeros((2, 2)),
            flow_direction: Array2::from_elem((2, 2), 180.0),
            counts: Array2::zeros((2, 2)),
            grid: grid(),
            members: 5,
        };
        let cfg = CorrectionConfig {
            coverage_filter: CoverageFilter::Disabled,
            ..CorrectionConfig::default()
        };
        let corrected = apply(&field, &record, None, Some(&reference), &cfg).unwrap();
        assert_eq!(corrected.ice_coverage, 0.0);
        assert!(corrected.quality_flags.contains(&QualityFlag::MaskedExcess));
        assert!(corrected.quality_flags.contains(&QualityFlag::LowCoverage));
    }

    #[test]
    fn test_run_skips_fields_whose_masks_cannot_be_resampled() {
        let _ = env_logger::builder().is_test(true).try_init();
        let other_epsg = GridSpec { epsg: 32624, ..grid() };
        let far_away = GridSpec {
            geo_transform: GeoTransform::from_gdal([90_000.0, 100.0, 0.0, 0.0, 0.0, -100.0]),
            ..grid()
        };
        let names = [
            (SAME, grid()),
            (
                "S2A_MSIL2A_20200801T120000_N0214_R083__S2A_MSIL2A_20200811T120000_N0214_R083",
                other_epsg,
            ),
            (
                "S2A_MSIL2A_20200901T120000_N0214_R083__S2A_MSIL2A_20200911T120000_N0214_R083",
                far_away,
            ),
        ];
        let mut fields = BTreeMap::new();
        let mut records = Vec::new();
        for (name, field_grid) in names {
            let id = FieldIdentifier::parse(name).unwrap();
            records.push(OrbitIndexer::record_for(&id));
            let ones = Array2::from_elem((2, 2), 1.0f32);
            let name = id.name.clone();
            fields.insert(name, RawField::new(id, ones.clone(), ones, field_grid).unwrap());
        }
        let refs: Vec<&OrbitPairRecord> = records.iter().collect();
        let mut cache = MaskCache::new(masks());

        let summary = FieldCorrector::run(
            &refs,
            &fields,
            &OffsetEstimate::default(),
            &mut cache,
            Period::Whole,
            &config(),
            &|_: Source| true,
        );

        println!("   corrected={} excluded={:?}", summary.corrected.len(), summary.excluded);
        assert_eq!(summary.corrected.len(), 1);
        assert_eq!(summary.corrected[0].record.field_id, SAME);
        assert_eq!(summary.excluded.len(), 2);
        assert!(summary
            .excluded
            .iter()
            .all(|(_, reason)| matches!(reason, Exclusion::MaskResample(_))));
    }
}
