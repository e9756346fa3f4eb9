//! Pipeline configuration, loaded once from TOML at the start of a run.

use crate::types::{GlacierError, GlacierResult, Source};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Whether the ice-coverage filter excludes poorly covered fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageFilter {
    Enabled,
    Disabled,
}

/// Output directory layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// `<output>/<unit>/<kind>`
    PerUnit,
    /// `<output>/<kind>/<unit>`
    Centralized,
}

/// How a stage's fatal outcome affects the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Critical,
    Graceful,
}

/// Per-source input settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub enabled: bool,
    /// Root holding `<unit>/<field_id>/<field_id>_{dx,dy}.tif`
    pub input_dir: PathBuf,
    /// Offset correction for cross-track pairs; masking only when false
    pub orbit_correction: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            input_dir: PathBuf::new(),
            orbit_correction: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub sentinel2: SourceConfig,
    pub landsat: SourceConfig,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            sentinel2: SourceConfig {
                input_dir: PathBuf::from("data/sentinel2"),
                ..SourceConfig::default()
            },
            landsat: SourceConfig {
                input_dir: PathBuf::from("data/landsat"),
                orbit_correction: false,
                ..SourceConfig::default()
            },
        }
    }
}

/// Reference and offset estimation thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    /// Minimum cross-track fields sharing a signature before an offset is estimated
    pub min_pair_samples: usize,
    /// Minimum finite same-track samples for a reference pixel to be valid
    pub reference_min_samples: usize,
    /// 3x3 NaN-aware median smoothing of each offset component
    pub offset_median_filter: bool,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            min_pair_samples: 5,
            reference_min_samples: 3,
            offset_median_filter: true,
        }
    }
}

/// Correction, filtering and quality-flag thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    pub coverage_filter: CoverageFilter,
    /// Fraction of ice pixels that must stay valid (filter threshold)
    pub min_ice_coverage: f64,
    pub flow_filter: bool,
    pub max_flow_deviation_deg: f32,
    /// Coverage below this raises `low_coverage`
    pub low_coverage_threshold: f64,
    /// Fraction of initially valid ice pixels removed by filters that raises `masked_excess`
    pub masked_excess_fraction: f64,
    /// Scale turning a median absolute deviation into a standard deviation estimate
    pub mad_scale: f32,
    pub write_previews: bool,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            coverage_filter: CoverageFilter::Enabled,
            min_ice_coverage: 0.01,
            flow_filter: true,
            max_flow_deviation_deg: 20.0,
            low_coverage_threshold: 0.25,
            masked_excess_fraction: 0.5,
            mad_scale: 1.4826,
            write_previews: true,
        }
    }
}

/// Delivery and discontinuity handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Reference-surface change date; `None` disables the pre/post split
    pub discontinuity_date: Option<NaiveDate>,
    /// Additionally write one delivery container per midpoint year
    pub split_by_year: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            discontinuity_date: NaiveDate::from_ymd_opt(2021, 8, 23),
            split_by_year: false,
        }
    }
}

/// Criticality designation per stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageCriticality {
    pub orbit_indexing: Criticality,
    pub offset_estimation: Criticality,
    pub field_correction: Criticality,
    pub sentinel2_stacking: Criticality,
    pub landsat_stacking: Criticality,
    pub merge: Criticality,
}

impl Default for StageCriticality {
    fn default() -> Self {
        Self {
            orbit_indexing: Criticality::Critical,
            offset_estimation: Criticality::Critical,
            field_correction: Criticality::Critical,
            sentinel2_stacking: Criticality::Graceful,
            landsat_stacking: Criticality::Graceful,
            merge: Criticality::Critical,
        }
    }
}

/// Descriptive attributes copied into every container and metadata record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectInfo {
    pub title: String,
    pub institution: String,
    pub contact: String,
    pub references: String,
}

impl Default for ProjectInfo {
    fn default() -> Self {
        Self {
            title: "Glacier surface velocity time series".to_string(),
            institution: String::new(),
            contact: String::new(),
            references: String::new(),
        }
    }
}

/// Complete configuration of a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Units to process; empty means every unit found under the source input dirs
    pub glaciers: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub output_dir: PathBuf,
    /// Root holding `<unit>/mask_{ice,ocean,rock}.tif`
    pub mask_dir: PathBuf,
    /// Root holding `<unit>.json` boundaries
    pub boundary_dir: PathBuf,
    pub layout: OutputLayout,
    pub workers: usize,
    /// Product version written into artifact names (`v01.1`)
    pub version: String,
    pub sources: SourcesConfig,
    pub estimation: EstimationConfig,
    pub correction: CorrectionConfig,
    pub merge: MergeConfig,
    pub criticality: StageCriticality,
    pub project: ProjectInfo,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            glaciers: Vec::new(),
            start_date: NaiveDate::from_ymd_opt(2017, 1, 1).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or_default(),
            output_dir: PathBuf::from("output"),
            mask_dir: PathBuf::from("data/masks"),
            boundary_dir: PathBuf::from("data/boundaries"),
            layout: OutputLayout::PerUnit,
            workers: 1,
            version: "01.1".to_string(),
            sources: SourcesConfig::default(),
            estimation: EstimationConfig::default(),
            correction: CorrectionConfig::default(),
            merge: MergeConfig::default(),
            criticality: StageCriticality::default(),
            project: ProjectInfo::default(),
        }
    }
}

impl PipelineConfig {
    /// `$XDG_CONFIG_HOME/glacierflow/config.toml` (platform equivalent elsewhere)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("glacierflow").join("config.toml"))
    }

    pub fn from_toml_str(text: &str) -> GlacierResult<Self> {
        let config: PipelineConfig =
            toml::from_str(text).map_err(|e| GlacierError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> GlacierResult<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> GlacierResult<String> {
        toml::to_string_pretty(self).map_err(|e| GlacierError::Config(e.to_string()))
    }

    /// Reject settings no stage can work with
    pub fn validate(&self) -> GlacierResult<()> {
        if self.start_date > self.end_date {
            return Err(GlacierError::Config(format!(
                "start_date {} is after end_date {}",
                self.start_date, self.end_date
            )));
        }
        if self.workers == 0 {
            return Err(GlacierError::Config("workers must be at least 1".to_string()));
        }
        if self.estimation.min_pair_samples == 0 || self.estimation.reference_min_samples == 0 {
            return Err(GlacierError::Config(
                "sample thresholds must be at least 1".to_string(),
            ));
        }
        let fractions = [
            ("min_ice_coverage", self.correction.min_ice_coverage),
            ("low_coverage_threshold", self.correction.low_coverage_threshold),
            ("masked_excess_fraction", self.correction.masked_excess_fraction),
        ];
        for (name, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(GlacierError::Config(format!(
                    "{} must lie in [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.version.is_empty() {
            return Err(GlacierError::Config("version must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn source(&self, source: Source) -> &SourceConfig {
        match source {
            Source::Sentinel2 => &self.sources.sentinel2,
            Source::Landsat => &self.sources.landsat,
        }
    }

    /// Enabled sources in canonical order
    pub fn enabled_sources(&self) -> Vec<Source> {
        Source::ALL
            .into_iter()
            .filter(|s| self.source(*s).enabled)
            .collect()
    }

    pub fn correction_enabled(&self, source: Source) -> bool {
        let cfg = self.source(source);
        cfg.enabled && cfg.orbit_correction
    }

    pub fn stacking_criticality(&self, source: Source) -> Criticality {
        match source {
            Source::Sentinel2 => self.criticality.sentinel2_stacking,
            Source::Landsat => self.criticality.landsat_stacking,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.estimation.min_pair_samples, 5);
        assert!(config.correction_enabled(Source::Sentinel2));
        assert!(!config.correction_enabled(Source::Landsat));
        assert_eq!(config.stacking_criticality(Source::Landsat), Criticality::Graceful);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            glaciers = ["001_alison"]
            start_date = "2020-01-01"
            end_date = "2020-12-31"
            layout = "centralized"

            [estimation]
            min_pair_samples = 3

            [correction]
            coverage_filter = "disabled"

            [criticality]
            landsat_stacking = "critical"
        "#;
        let config = PipelineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.layout, OutputLayout::Centralized);
        assert_eq!(config.estimation.min_pair_samples, 3);
        assert_eq!(config.estimation.reference_min_samples, 3);
        assert_eq!(config.correction.coverage_filter, CoverageFilter::Disabled);
        assert_eq!(config.criticality.landsat_stacking, Criticality::Critical);
        assert_eq!(config.workers, 1);
    }

    #[test]
    fn test_rejects_inverted_dates() {
        let text = "start_date = \"2021-01-01\"\nend_date = \"2020-01-01\"\n";
        assert!(matches!(
            PipelineConfig::from_toml_str(text),
            Err(GlacierError::Config(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip_preserves_thresholds() {
        let mut config = PipelineConfig::default();
        config.correction.max_flow_deviation_deg = 30.0;
        let text = config.to_toml_string().unwrap();
        let back = PipelineConfig::from_toml_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
