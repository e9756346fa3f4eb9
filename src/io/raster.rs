use crate::types::{
    GeoTransform, GlacierError, GlacierResult, GridSpec, MaskRaster, Raster, DEFAULT_EPSG,
    NODATA_VALUE,
};
use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::path::Path;

/// GeoTIFF reader/writer for single-band velocity, offset and mask rasters
pub struct RasterIo;

impl RasterIo {
    fn grid_of(dataset: &Dataset) -> GridSpec {
        let geo_transform = dataset
            .geo_transform()
            .map(GeoTransform::from_gdal)
            .unwrap_or(GeoTransform::from_gdal([0.0, 1.0, 0.0, 0.0, 0.0, -1.0]));
        let (cols, rows) = dataset.raster_size();
        let epsg = dataset
            .spatial_ref()
            .ok()
            .and_then(|srs| srs.auth_code().ok())
            .and_then(|code| u32::try_from(code).ok())
            .unwrap_or(DEFAULT_EPSG);
        GridSpec {
            geo_transform,
            rows,
            cols,
            epsg,
        }
    }

    /// Read band 1 as `f32`, turning the band's no-data value and non-finite values into NaN
    pub fn read_f32<P: AsRef<Path>>(path: P) -> GlacierResult<(Raster, GridSpec)> {
        log::debug!("Reading raster {}", path.as_ref().display());
        let dataset = Dataset::open(path.as_ref())?;
        let grid = Self::grid_of(&dataset);
        let band = dataset.rasterband(1)?;
        let nodata = band.no_data_value().map(|v| v as f32);
        let buffer = band.read_as::<f32>(
            (0, 0),
            (grid.cols, grid.rows),
            (grid.cols, grid.rows),
            None,
        )?;
        let mut raster = Array2::from_shape_vec((grid.rows, grid.cols), buffer.data)
            .map_err(|e| GlacierError::Processing(format!("Failed to reshape raster: {}", e)))?;
        raster.mapv_inplace(|v| match nodata {
            Some(nd) if v == nd => f32::NAN,
            _ if !v.is_finite() => f32::NAN,
            _ => v,
        });
        Ok((raster, grid))
    }

    /// Read band 1 as a binary mask: any non-zero, non-no-data value is inside
    pub fn read_mask<P: AsRef<Path>>(path: P) -> GlacierResult<(MaskRaster, GridSpec)> {
        let (values, grid) = Self::read_f32(path)?;
        let mask = values.mapv(|v| u8::from(v.is_finite() && v != 0.0));
        Ok((mask, grid))
    }

    /// Write a single-band `f32` GeoTIFF; NaN is stored as the no-data value
    pub fn write_f32<P: AsRef<Path>>(
        path: P,
        raster: &Raster,
        grid: &GridSpec,
    ) -> GlacierResult<()> {
        let (rows, cols) = raster.dim();
        if (rows, cols) != grid.shape() {
            return Err(GlacierError::GridMismatch(format!(
                "raster is {}x{} but grid is {}x{}",
                rows, cols, grid.rows, grid.cols
            )));
        }
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset =
            driver.create_with_band_type::<f32, _>(path.as_ref(), cols as isize, rows as isize, 1)?;
        dataset.set_geo_transform(&grid.geo_transform.to_gdal())?;
        let srs = SpatialRef::from_epsg(grid.epsg)?;
        dataset.set_spatial_ref(&srs)?;

        let data: Vec<f32> = raster
            .iter()
            .map(|v| if v.is_finite() { *v } else { NODATA_VALUE })
            .collect();
        let mut band = dataset.rasterband(1)?;
        band.set_no_data_value(Some(NODATA_VALUE as f64))?;
        band.write((0, 0), (cols, rows), &Buffer::new((cols, rows), data))?;
        Ok(())
    }

    /// Write a mask as a `f32` GeoTIFF of zeros and ones
    pub fn write_mask<P: AsRef<Path>>(
        path: P,
        mask: &MaskRaster,
        grid: &GridSpec,
    ) -> GlacierResult<()> {
        let values = mask.mapv(f32::from);
        Self::write_f32(path, &values, grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    fn grid() -> GridSpec {
        GridSpec {
            geo_transform: GeoTransform::from_gdal([
                -200000.0, 100.0, 0.0, -2000000.0, 0.0, -100.0,
            ]),
            rows: 2,
            cols: 3,
            epsg: 3413,
        }
    }

    #[test]
    fn test_geotiff_preserves_nan_and_grid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vx.tif");
        let raster = array![[1.0f32, f32::NAN, 3.0], [4.0, 5.0, -6.5]];
        RasterIo::write_f32(&path, &raster, &grid()).unwrap();

        let (back, back_grid) = RasterIo::read_f32(&path).unwrap();
        assert!(back_grid.is_compatible(&grid()));
        assert!(back[[0, 1]].is_nan());
        assert_eq!(back[[1, 2]], -6.5);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let raster = Array2::<f32>::zeros((4, 4));
        let result = RasterIo::write_f32(dir.path().join("bad.tif"), &raster, &grid());
        assert!(matches!(result, Err(GlacierError::GridMismatch(_))));
    }
}
