use crate::io::raster::RasterIo;
use crate::types::{GlacierError, GlacierResult, GridSpec, MaskRaster};
use ndarray::{Array2, Zip};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Static ice/ocean/rock masks on one grid
#[derive(Debug, Clone)]
pub struct MaskSet {
    pub ice: MaskRaster,
    pub ocean: MaskRaster,
    /// Stable ground used for error statistics
    pub rock: MaskRaster,
    pub grid: GridSpec,
}

impl MaskSet {
    /// Build a set from ice and ocean masks, deriving rock as neither ice nor ocean
    pub fn from_ice_ocean(
        ice: MaskRaster,
        ocean: MaskRaster,
        grid: GridSpec,
    ) -> GlacierResult<Self> {
        if ice.dim() != grid.shape() || ocean.dim() != grid.shape() {
            return Err(GlacierError::GridMismatch(
                "ice and ocean masks must share the mask grid".to_string(),
            ));
        }
        let rock = Zip::from(&ice)
            .and(&ocean)
            .map_collect(|i, o| u8::from(*i == 0 && *o == 0));
        Ok(Self { ice, ocean, rock, grid })
    }

    /// Load `mask_ice.tif`, `mask_ocean.tif` and the optional `mask_rock.tif` of a unit
    pub fn load<P: AsRef<Path>>(mask_dir: P, unit: &str) -> GlacierResult<Self> {
        let dir = mask_dir.as_ref().join(unit);
        log::info!("Loading static masks from {}", dir.display());
        let (ice, grid) = RasterIo::read_mask(dir.join("mask_ice.tif"))?;
        let (ocean, ocean_grid) = RasterIo::read_mask(dir.join("mask_ocean.tif"))?;
        if !grid.is_compatible(&ocean_grid) {
            return Err(GlacierError::GridMismatch(format!(
                "ocean mask grid differs from ice mask grid in {}",
                dir.display()
            )));
        }
        let mut set = Self::from_ice_ocean(ice, ocean, grid)?;

        let rock_path = dir.join("mask_rock.tif");
        if rock_path.exists() {
            let (rock, rock_grid) = RasterIo::read_mask(&rock_path)?;
            set.rock = if rock_grid.is_compatible(&set.grid) {
                rock
            } else {
                resample_nearest(&rock, &rock_grid, &set.grid)?
            };
        } else {
            log::debug!("No rock mask for {}, deriving it from ice and ocean", unit);
        }
        Ok(set)
    }

    /// Nearest-neighbour resample of every mask onto `target`
    pub fn resample_to(&self, target: &GridSpec) -> GlacierResult<MaskSet> {
        if self.grid.is_compatible(target) {
            return Ok(self.clone());
        }
        Ok(MaskSet {
            ice: resample_nearest(&self.ice, &self.grid, target)?,
            ocean: resample_nearest(&self.ocean, &self.grid, target)?,
            rock: resample_nearest(&self.rock, &self.grid, target)?,
            grid: target.clone(),
        })
    }

    /// Write the masks as GeoTIFFs into `dir`
    pub fn write_all(&self, dir: &Path) -> GlacierResult<Vec<PathBuf>> {
        let mut written = Vec::new();
        let masks = [
            ("mask_ice.tif", &self.ice),
            ("mask_ocean.tif", &self.ocean),
            ("mask_rock.tif", &self.rock),
        ];
        for (name, mask) in masks {
            let path = dir.join(name);
            crate::io::workspace::commit_with(&path, |tmp| {
                RasterIo::write_mask(tmp, mask, &self.grid)
            })?;
            written.push(path);
        }
        Ok(written)
    }
}

/// Nearest-neighbour resampling of a mask between north-up grids.
///
/// Target pixels falling outside the source are outside the mask (0).
pub fn resample_nearest(
    mask: &MaskRaster,
    source: &GridSpec,
    target: &GridSpec,
) -> GlacierResult<MaskRaster> {
    if source.epsg != target.epsg {
        return Err(GlacierError::MaskResample(format!(
            "mask EPSG:{} cannot be resampled to EPSG:{}",
            source.epsg, target.epsg
        )));
    }
    let gt = &source.geo_transform;
    if gt.pixel_width == 0.0 || gt.pixel_height == 0.0 {
        return Err(GlacierError::MaskResample("degenerate mask geotransform".to_string()));
    }
    if !source.bounding_box().intersects(&target.bounding_box()) {
        return Err(GlacierError::MaskResample(
            "mask grid does not overlap the field grid".to_string(),
        ));
    }
    let (src_rows, src_cols) = mask.dim();
    let mut out = Array2::<u8>::zeros(target.shape());
    Zip::indexed(&mut out).for_each(|(row, col), value| {
        let x = target.x_center(col);
        let y = target.y_center(row);
        let src_col = ((x - gt.top_left_x) / gt.pixel_width).floor();
        let src_row = ((y - gt.top_left_y) / gt.pixel_height).floor();
        if src_col >= 0.0
            && src_row >= 0.0
            && (src_col as usize) < src_cols
            && (src_row as usize) < src_rows
        {
            *value = mask[[src_row as usize, src_col as usize]];
        }
    });
    Ok(out)
}

/// Static masks plus a per-grid cache of their resampled versions
pub struct MaskCache {
    base: MaskSet,
    resampled: HashMap<String, Arc<MaskSet>>,
}

impl MaskCache {
    pub fn new(base: MaskSet) -> Self {
        Self {
            base,
            resampled: HashMap::new(),
        }
    }

    fn key(grid: &GridSpec) -> String {
        let gt = grid.geo_transform.to_gdal();
        format!(
            "{}x{}@{}:{:.3}:{:.3}:{:.3}:{:.3}",
            grid.rows, grid.cols, grid.epsg, gt[0], gt[1], gt[3], gt[5]
        )
    }

    /// Masks on `grid`, resampling at most once per distinct grid
    pub fn for_grid(&mut self, grid: &GridSpec) -> GlacierResult<Arc<MaskSet>> {
        let key = Self::key(grid);
        if let Some(masks) = self.resampled.get(&key) {
            return Ok(Arc::clone(masks));
        }
        log::debug!("Resampling masks to grid {}", key);
        let masks = Arc::new(self.base.resample_to(grid)?);
        self.resampled.insert(key, Arc::clone(&masks));
        Ok(masks)
    }

    pub fn cached_grids(&self) -> usize {
        self.resampled.len()
    }
}
