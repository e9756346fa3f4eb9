use crate::config::PipelineConfig;
use crate::io::identifier::FieldIdentifier;
use crate::io::raster::RasterIo;
use crate::types::{GlacierError, GlacierResult, GridSpec, MaskRaster, Raster, Source};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// One raw velocity field (metres/day) for a scene pair
#[derive(Debug, Clone)]
pub struct RawField {
    pub id: FieldIdentifier,
    pub dx: Raster,
    pub dy: Raster,
    /// Optional per-field validity mask, 0 = invalid
    pub validity: Option<MaskRaster>,
    pub grid: GridSpec,
}

impl RawField {
    pub fn new(id: FieldIdentifier, dx: Raster, dy: Raster, grid: GridSpec) -> GlacierResult<Self> {
        if dx.dim() != grid.shape() || dy.dim() != grid.shape() {
            return Err(GlacierError::GridMismatch(format!(
                "{}: dx {:?} / dy {:?} do not match grid {:?}",
                id.name,
                dx.dim(),
                dy.dim(),
                grid.shape()
            )));
        }
        Ok(Self {
            id,
            dx,
            dy,
            validity: None,
            grid,
        })
    }

    pub fn with_validity(mut self, validity: MaskRaster) -> GlacierResult<Self> {
        if validity.dim() != self.grid.shape() {
            return Err(GlacierError::GridMismatch(format!(
                "{}: validity mask does not match grid",
                self.id.name
            )));
        }
        self.validity = Some(validity);
        Ok(self)
    }
}

/// Read-only source of raw fields, produced upstream
pub trait RawFieldStore: Send + Sync {
    /// Units with any data for `source`
    fn units(&self, source: Source) -> GlacierResult<Vec<String>>;

    /// Raw field names of `unit` for `source`, sorted
    fn list(&self, unit: &str, source: Source) -> GlacierResult<Vec<String>>;

    fn load(&self, unit: &str, source: Source, field_id: &str) -> GlacierResult<RawField>;
}

/// Store over `<input_dir>/<unit>/<field_id>/<field_id>_{dx,dy}.tif`
pub struct GeoTiffFieldStore {
    roots: HashMap<Source, PathBuf>,
}

impl GeoTiffFieldStore {
    pub fn new(roots: HashMap<Source, PathBuf>) -> Self {
        Self { roots }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let roots = config
            .enabled_sources()
            .into_iter()
            .map(|s| (s, config.source(s).input_dir.clone()))
            .collect();
        Self::new(roots)
    }

    fn root(&self, source: Source) -> Option<&Path> {
        self.roots.get(&source).map(PathBuf::as_path)
    }

    fn subdirs(dir: &Path) -> GlacierResult<Vec<String>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl RawFieldStore for GeoTiffFieldStore {
    fn units(&self, source: Source) -> GlacierResult<Vec<String>> {
        match self.root(source) {
            Some(root) => Self::subdirs(root),
            None => Ok(Vec::new()),
        }
    }

    fn list(&self, unit: &str, source: Source) -> GlacierResult<Vec<String>> {
        match self.root(source) {
            Some(root) => Self::subdirs(&root.join(unit)),
            None => Ok(Vec::new()),
        }
    }

    fn load(&self, unit: &str, source: Source, field_id: &str) -> GlacierResult<RawField> {
        let root = self
            .root(source)
            .ok_or_else(|| GlacierError::Config(format!("no input directory for {}", source)))?;
        let id = FieldIdentifier::parse_for(source, field_id)?;
        let dir = root.join(unit).join(field_id);
        let (dx, grid) = RasterIo::read_f32(dir.join(format!("{}_dx.tif", field_id)))?;
        let (dy, dy_grid) = RasterIo::read_f32(dir.join(format!("{}_dy.tif", field_id)))?;
        if !grid.is_compatible(&dy_grid) {
            return Err(GlacierError::GridMismatch(format!(
                "{}: dx and dy grids differ",
                field_id
            )));
        }
        let field = RawField::new(id, dx, dy, grid)?;
        let mask_path = dir.join(format!("{}_mask.tif", field_id));
        if mask_path.exists() {
            let (validity, _) = RasterIo::read_mask(&mask_path)?;
            return field.with_validity(validity);
        }
        Ok(field)
    }
}

/// In-memory store, keyed by unit and source
#[derive(Default)]
pub struct MemoryFieldStore {
    fields: BTreeMap<(String, Source), BTreeMap<String, RawField>>,
}

impl MemoryFieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, unit: &str, field: RawField) {
        self.fields
            .entry((unit.to_string(), field.id.source))
            .or_default()
            .insert(field.id.name.clone(), field);
    }
}

impl RawFieldStore for MemoryFieldStore {
    fn units(&self, source: Source) -> GlacierResult<Vec<String>> {
        Ok(self
            .fields
            .keys()
            .filter(|(_, s)| *s == source)
            .map(|(u, _)| u.clone())
            .collect())
    }

    fn list(&self, unit: &str, source: Source) -> GlacierResult<Vec<String>> {
        Ok(self
            .fields
            .get(&(unit.to_string(), source))
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn load(&self, unit: &str, source: Source, field_id: &str) -> GlacierResult<RawField> {
        self.fields
            .get(&(unit.to_string(), source))
            .and_then(|m| m.get(field_id))
            .cloned()
            .ok_or_else(|| GlacierError::Processing(format!("{} not found in {}", field_id, unit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use ndarray::Array2;
    use tempfile::TempDir;

    const NAME: &str =
        "S2A_MSIL2A_20200716T162839_N0214_R083__S2A_MSIL2A_20200726T162839_N0214_R083";

    fn grid() -> GridSpec {
        GridSpec {
            geo_transform: GeoTransform::from_gdal([0.0, 100.0, 0.0, 0.0, 0.0, -100.0]),
            rows: 2,
            cols: 2,
            epsg: 3413,
        }
    }

    #[test]
    fn test_geotiff_store_lists_and_loads() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("001_alison").join(NAME);
        std::fs::create_dir_all(&dir).unwrap();
        let dx = Array2::from_elem((2, 2), 1.5f32);
        let dy = Array2::from_elem((2, 2), -0.5f32);
        RasterIo::write_f32(dir.join(format!("{}_dx.tif", NAME)), &dx, &grid()).unwrap();
        RasterIo::write_f32(dir.join(format!("{}_dy.tif", NAME)), &dy, &grid()).unwrap();

        let mut roots = HashMap::new();
        roots.insert(Source::Sentinel2, root.path().to_path_buf());
        let store = GeoTiffFieldStore::new(roots);
        assert_eq!(store.units(Source::Sentinel2).unwrap(), vec!["001_alison"]);
        assert!(store.units(Source::Landsat).unwrap().is_empty());
        assert_eq!(store.list("001_alison", Source::Sentinel2).unwrap(), vec![NAME]);

        let field = store.load("001_alison", Source::Sentinel2, NAME).unwrap();
        assert_eq!(field.dx[[1, 1]], 1.5);
        assert!(field.validity.is_none());
    }

    #[test]
    fn test_raw_field_shape_check() {
        let id = FieldIdentifier::parse(NAME).unwrap();
        let bad = RawField::new(id, Array2::zeros((3, 3)), Array2::zeros((2, 2)), grid());
        assert!(matches!(bad, Err(GlacierError::GridMismatch(_))));
    }
}
