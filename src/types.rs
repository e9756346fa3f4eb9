use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Real-valued raster (metres/day or metres), NaN marks invalid pixels
pub type Raster = Array2<f32>;

/// Binary mask raster (1 = inside, 0 = outside)
pub type MaskRaster = Array2<u8>;

/// No-data value written into GeoTIFF outputs
pub const NODATA_VALUE: f32 = -9999.0;

/// EPSG code of the NSIDC Sea Ice Polar Stereographic North projection
pub const DEFAULT_EPSG: u32 = 3413;

/// Independent data source feeding a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Sentinel2,
    Landsat,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Sentinel2, Source::Landsat];

    /// Short prefix used in artifact names (e.g. `S2_001_alison_v01.1.npz`)
    pub fn prefix(&self) -> &'static str {
        match self {
            Source::Sentinel2 => "S2",
            Source::Landsat => "L8",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Sentinel2 => write!(f, "sentinel2"),
            Source::Landsat => write!(f, "landsat"),
        }
    }
}

/// Relative orbit (Sentinel-2 `R083`) or path/row (Landsat `008011`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelativeOrbit(pub String);

impl fmt::Display for RelativeOrbit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Geospatial bounding box in projected coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }
}

/// Pixel grid of a raster: transform, shape and spatial reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub geo_transform: GeoTransform,
    pub rows: usize,
    pub cols: usize,
    pub epsg: u32,
}

impl GridSpec {
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let gt = &self.geo_transform;
        let x0 = gt.top_left_x;
        let x1 = gt.top_left_x + self.cols as f64 * gt.pixel_width;
        let y0 = gt.top_left_y;
        let y1 = gt.top_left_y + self.rows as f64 * gt.pixel_height;
        BoundingBox {
            min_x: x0.min(x1),
            max_x: x0.max(x1),
            min_y: y0.min(y1),
            max_y: y0.max(y1),
        }
    }

    /// Projected coordinate of the centre of column `col`
    pub fn x_center(&self, col: usize) -> f64 {
        self.geo_transform.top_left_x + (col as f64 + 0.5) * self.geo_transform.pixel_width
    }

    /// Projected coordinate of the centre of row `row`
    pub fn y_center(&self, row: usize) -> f64 {
        self.geo_transform.top_left_y + (row as f64 + 0.5) * self.geo_transform.pixel_height
    }

    /// Grids are compatible when shape, EPSG and transform agree to a hundredth of a metre
    pub fn is_compatible(&self, other: &GridSpec) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() < 1e-2;
        self.rows == other.rows
            && self.cols == other.cols
            && self.epsg == other.epsg
            && close(self.geo_transform.top_left_x, other.geo_transform.top_left_x)
            && close(self.geo_transform.top_left_y, other.geo_transform.top_left_y)
            && close(self.geo_transform.pixel_width, other.geo_transform.pixel_width)
            && close(self.geo_transform.pixel_height, other.geo_transform.pixel_height)
    }
}

/// Acquisition window spanned by the two scenes of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AcquisitionWindow {
    pub fn midpoint(&self) -> DateTime<Utc> {
        self.start + (self.end - self.start) / 2
    }

    /// Temporal baseline in fractional days
    pub fn baseline_days(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 86_400.0
    }
}

/// Scene-level metadata for one acquisition of a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneInfo {
    pub satellite: String,
    pub datetime: DateTime<Utc>,
    pub orbit: RelativeOrbit,
    pub processing_version: String,
}

/// Pair classification by relative orbit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackClass {
    SameTrack,
    CrossTrack,
}

impl TrackClass {
    pub fn classify(orbit1: &RelativeOrbit, orbit2: &RelativeOrbit) -> Self {
        if orbit1 == orbit2 {
            TrackClass::SameTrack
        } else {
            TrackClass::CrossTrack
        }
    }
}

impl fmt::Display for TrackClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackClass::SameTrack => write!(f, "same_track"),
            TrackClass::CrossTrack => write!(f, "cross_track"),
        }
    }
}

/// Whether a pair's orbits appear in signature order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    Forward,
    Reversed,
}

impl Orientation {
    pub fn sign(&self) -> f32 {
        match self {
            Orientation::Forward => 1.0,
            Orientation::Reversed => -1.0,
        }
    }
}

/// Unordered orbit-pair signature, keyed per source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrbitPairSignature {
    pub source: Source,
    pub low: RelativeOrbit,
    pub high: RelativeOrbit,
}

impl OrbitPairSignature {
    /// Canonical signature for the orbits of scene 1 and scene 2
    pub fn canonical(
        source: Source,
        orbit1: &RelativeOrbit,
        orbit2: &RelativeOrbit,
    ) -> (Self, Orientation) {
        if orbit1 <= orbit2 {
            (
                Self { source, low: orbit1.clone(), high: orbit2.clone() },
                Orientation::Forward,
            )
        } else {
            (
                Self { source, low: orbit2.clone(), high: orbit1.clone() },
                Orientation::Reversed,
            )
        }
    }

    /// File-name token, e.g. `R040_R083` or `P008011_P009011`
    pub fn token(&self) -> String {
        let tag = match self.source {
            Source::Sentinel2 => "R",
            Source::Landsat => "P",
        };
        format!("{}{}_{}{}", tag, self.low, tag, self.high)
    }
}

impl fmt::Display for OrbitPairSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source.prefix(), self.token())
    }
}

/// One row of the orbit-pair table, one per parseable raw field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitPairRecord {
    pub field_id: String,
    pub source: Source,
    pub satellite_1: String,
    pub satellite_2: String,
    pub datetime_1: DateTime<Utc>,
    pub datetime_2: DateTime<Utc>,
    pub orbit_1: String,
    pub orbit_2: String,
    pub processing_1: String,
    pub processing_2: String,
    pub baseline_days: f64,
    pub midpoint: DateTime<Utc>,
    pub classification: TrackClass,
}

impl OrbitPairRecord {
    pub fn window(&self) -> AcquisitionWindow {
        AcquisitionWindow {
            start: self.datetime_1,
            end: self.datetime_2,
        }
    }

    pub fn signature(&self) -> (OrbitPairSignature, Orientation) {
        OrbitPairSignature::canonical(
            self.source,
            &RelativeOrbit(self.orbit_1.clone()),
            &RelativeOrbit(self.orbit_2.clone()),
        )
    }

    pub fn is_same_track(&self) -> bool {
        self.classification == TrackClass::SameTrack
    }
}

/// Slice of the requested date range relative to a reference-surface discontinuity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Whole,
    PreDiscontinuity,
    PostDiscontinuity,
}

impl Period {
    /// Sub-directory name for split runs
    pub fn dir_name(&self) -> Option<&'static str> {
        match self {
            Period::Whole => None,
            Period::PreDiscontinuity => Some("pre_discontinuity"),
            Period::PostDiscontinuity => Some("post_discontinuity"),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Whole => write!(f, "whole"),
            Period::PreDiscontinuity => write!(f, "pre_discontinuity"),
            Period::PostDiscontinuity => write!(f, "post_discontinuity"),
        }
    }
}

/// Half-open time range `[start, end)` covered by one period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodWindow {
    pub period: Period,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodWindow {
    /// A pair belongs to the period when both scenes fall inside it
    pub fn contains(&self, window: &AcquisitionWindow) -> bool {
        self.start <= window.start && window.end < self.end
    }

    /// Whether the pair spans `boundary` (first scene before, second scene at or after)
    pub fn straddles(window: &AcquisitionWindow, boundary: DateTime<Utc>) -> bool {
        window.start < boundary && window.end >= boundary
    }
}

/// Per-step quality flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    LowCoverage,
    MaskedExcess,
}

impl QualityFlag {
    pub fn bit(&self) -> u8 {
        match self {
            QualityFlag::LowCoverage => 0b01,
            QualityFlag::MaskedExcess => 0b10,
        }
    }

    pub fn to_bits(flags: &[QualityFlag]) -> u8 {
        flags.iter().fold(0, |acc, f| acc | f.bit())
    }

    pub fn from_bits(bits: u8) -> Vec<QualityFlag> {
        [QualityFlag::LowCoverage, QualityFlag::MaskedExcess]
            .into_iter()
            .filter(|f| bits & f.bit() != 0)
            .collect()
    }
}

/// Velocity error statistics over stable (rock) ground, metres/day
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    pub mean_vx: f64,
    pub std_vx: f64,
    pub mean_vy: f64,
    pub std_vy: f64,
    pub rmse_vv: f64,
    pub rock_pixels: usize,
}

impl ErrorStatistics {
    pub fn unavailable() -> Self {
        Self {
            mean_vx: f64::NAN,
            std_vx: f64::NAN,
            mean_vy: f64::NAN,
            std_vy: f64::NAN,
            rmse_vv: f64::NAN,
            rock_pixels: 0,
        }
    }

    /// Same statistics in displacement units (metres over the baseline)
    pub fn to_displacement(&self, baseline_days: f64) -> Self {
        Self {
            mean_vx: self.mean_vx * baseline_days,
            std_vx: self.std_vx * baseline_days,
            mean_vy: self.mean_vy * baseline_days,
            std_vy: self.std_vy * baseline_days,
            rmse_vv: self.rmse_vv * baseline_days,
            rock_pixels: self.rock_pixels,
        }
    }
}

/// Error types for glacier velocity processing
#[derive(Debug, thiserror::Error)]
pub enum GlacierError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Malformed field identifier '{name}': {reason}")]
    MalformedIdentifier { name: String, reason: String },

    #[error("Insufficient samples for {signature}: {count} fields, threshold {threshold}")]
    InsufficientSamples {
        signature: String,
        count: usize,
        threshold: usize,
    },

    #[error("No correctable fields for source {sensor} of unit {unit}")]
    EmptySource { unit: String, sensor: Source },

    #[error("Critical failure in {stage}: {reason}")]
    CriticalStage { stage: String, reason: String },

    #[error("No source stacks survived for unit {unit}; nothing to merge")]
    MergeImpossible { unit: String },

    #[error("Mask resampling failed: {0}")]
    MaskResample(String),

    #[error("Grid mismatch: {0}")]
    GridMismatch(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Container archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),
}

/// Result type for glacier processing operations
pub type GlacierResult<T> = Result<T, GlacierError>;
