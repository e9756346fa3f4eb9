use crate::io::workspace::commit_bytes;
use crate::types::{BoundingBox, GlacierError, GlacierResult, DEFAULT_EPSG};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Boundary association of a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitBoundary {
    #[serde(default)]
    pub unit: String,
    pub bounding_box: BoundingBox,
    #[serde(default = "default_epsg")]
    pub epsg: u32,
    /// Optional GeoJSON geometry, carried through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polygon: Option<serde_json::Value>,
}

fn default_epsg() -> u32 {
    DEFAULT_EPSG
}

/// External supplier of unit boundaries
pub trait BoundaryProvider: Send + Sync {
    fn boundary(&self, unit: &str) -> GlacierResult<UnitBoundary>;
}

/// Reads `<dir>/<unit>.json`
pub struct JsonBoundaryProvider {
    dir: PathBuf,
}

impl JsonBoundaryProvider {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl BoundaryProvider for JsonBoundaryProvider {
    fn boundary(&self, unit: &str) -> GlacierResult<UnitBoundary> {
        let path = self.dir.join(format!("{}.json", unit));
        let text = std::fs::read_to_string(&path).map_err(|e| {
            GlacierError::Io(std::io::Error::new(
                e.kind(),
                format!("boundary {}: {}", path.display(), e),
            ))
        })?;
        let mut boundary: UnitBoundary = serde_json::from_str(&text)?;
        boundary.unit = unit.to_string();
        Ok(boundary)
    }
}

/// In-memory boundaries, keyed by unit
#[derive(Default)]
pub struct StaticBoundaryProvider {
    boundaries: HashMap<String, UnitBoundary>,
}

impl StaticBoundaryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, boundary: UnitBoundary) {
        self.boundaries.insert(boundary.unit.clone(), boundary);
    }
}

impl BoundaryProvider for StaticBoundaryProvider {
    fn boundary(&self, unit: &str) -> GlacierResult<UnitBoundary> {
        self.boundaries
            .get(unit)
            .cloned()
            .ok_or_else(|| GlacierError::Processing(format!("no boundary for unit {}", unit)))
    }
}

/// Persist the boundary association as `<dir>/<unit>.json`
pub fn persist_boundary(boundary: &UnitBoundary, dir: &Path) -> GlacierResult<PathBuf> {
    let path = dir.join(format!("{}.json", boundary.unit));
    let bytes = serde_json::to_vec_pretty(boundary)?;
    commit_bytes(&path, &bytes)?;
    Ok(path)
}
