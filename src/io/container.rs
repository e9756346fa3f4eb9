//! Self-describing array container.
//!
//! A container is a zip archive of `.npy` arrays (so `numpy.load` opens it as
//! an `.npz`) plus an `attributes.json` member holding the grid, variable and
//! global attributes and the string-valued per-step variables.
//!
//! Arrays written:
//! - `vx`, `vy`, `ux`, `uy`: `f32`, shape `[steps, rows, cols]`, metres/day
//! - `x`, `y`: pixel-centre coordinates
//! - `scene_1_datetime`, `scene_2_datetime`, `midpoint_datetime`: `i64` Unix seconds
//! - `baseline_days`, `percent_ice_area_notnull`, `error_*`: `f64` per step
//! - `quality_flags`: `u8` bit set per step

use crate::io::workspace::commit_with;
use crate::types::{
    ErrorStatistics, GlacierError, GlacierResult, GridSpec, Period, QualityFlag, Source,
};
use chrono::{DateTime, TimeZone, Utc};
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use npyz::WriterBuilder;

const ATTRIBUTES_MEMBER: &str = "attributes.json";
const EPOCH_SECONDS: &str = "seconds since 1970-01-01T00:00:00Z";

/// Non-raster description of one time step
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub field_id: String,
    pub source: Source,
    pub period: Period,
    pub scene_1_datetime: DateTime<Utc>,
    pub scene_2_datetime: DateTime<Utc>,
    pub satellite_1: String,
    pub satellite_2: String,
    pub orbit_1: String,
    pub orbit_2: String,
    pub processing_version: String,
    pub offset_signature: Option<String>,
    pub baseline_days: f64,
    /// Fraction (0-1) of ice pixels holding a valid velocity
    pub ice_coverage: f64,
    pub error: ErrorStatistics,
    pub quality_flags: Vec<QualityFlag>,
}

impl StepRecord {
    pub fn midpoint(&self) -> DateTime<Utc> {
        self.scene_1_datetime + (self.scene_2_datetime - self.scene_1_datetime) / 2
    }
}

/// String-valued part of a step, stored in `attributes.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepLabels {
    field_id: String,
    source: Source,
    period: Period,
    satellite_1: String,
    satellite_2: String,
    orbit_1: String,
    orbit_2: String,
    processing_version: String,
    offset_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Attributes {
    global: BTreeMap<String, String>,
    grid: GridSpec,
    variables: BTreeMap<String, BTreeMap<String, String>>,
    steps: Vec<StepLabels>,
}

/// Time-indexed velocity stack with its metadata
#[derive(Debug, Clone)]
pub struct ArrayContainer {
    pub grid: GridSpec,
    pub vx: Array3<f32>,
    pub vy: Array3<f32>,
    pub ux: Array3<f32>,
    pub uy: Array3<f32>,
    pub steps: Vec<StepRecord>,
    pub global_attributes: BTreeMap<String, String>,
}

fn variable_attributes() -> BTreeMap<String, BTreeMap<String, String>> {
    let entries: [(&str, &str, &str); 13] = [
        ("vx", "m/d", "velocity component in x direction"),
        ("vy", "m/d", "velocity component in y direction"),
        ("ux", "m/d", "uncertainty of vx"),
        ("uy", "m/d", "uncertainty of vy"),
        ("x", "m", "projection x coordinate of pixel centre"),
        ("y", "m", "projection y coordinate of pixel centre"),
        ("scene_1_datetime", EPOCH_SECONDS, "acquisition time of first scene"),
        ("scene_2_datetime", EPOCH_SECONDS, "acquisition time of second scene"),
        ("midpoint_datetime", EPOCH_SECONDS, "midpoint of acquisition window"),
        ("baseline_days", "days", "temporal baseline"),
        ("percent_ice_area_notnull", "percent", "share of ice pixels with valid velocity"),
        ("error_std_vx", "m/d", "standard deviation of vx over stable ground"),
        ("quality_flags", "1", "bit 0 low_coverage, bit 1 masked_excess"),
    ];
    entries
        .iter()
        .map(|(name, units, long_name)| {
            let mut attrs = BTreeMap::new();
            attrs.insert("units".to_string(), units.to_string());
            attrs.insert("long_name".to_string(), long_name.to_string());
            (name.to_string(), attrs)
        })
        .collect()
}

impl ArrayContainer {
    fn cubes(&self) -> [(&'static str, &Array3<f32>); 4] {
        [("vx", &self.vx), ("vy", &self.vy), ("ux", &self.ux), ("uy", &self.uy)]
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check that every array agrees with the grid and the step count
    pub fn validate(&self) -> GlacierResult<()> {
        let expected = (self.steps.len(), self.grid.rows, self.grid.cols);
        for (name, array) in self.cubes() {
            if array.dim() != expected {
                return Err(GlacierError::GridMismatch(format!(
                    "{} has shape {:?}, expected {:?}",
                    name,
                    array.dim(),
                    expected
                )));
            }
        }
        Ok(())
    }

    /// New container holding the given steps, in the given order
    pub fn select(&self, indices: &[usize]) -> ArrayContainer {
        ArrayContainer {
            grid: self.grid.clone(),
            vx: self.vx.select(Axis(0), indices),
            vy: self.vy.select(Axis(0), indices),
            ux: self.ux.select(Axis(0), indices),
            uy: self.uy.select(Axis(0), indices),
            steps: indices.iter().map(|i| self.steps[*i].clone()).collect(),
            global_attributes: self.global_attributes.clone(),
        }
    }

    /// Write atomically to `path`
    pub fn write(&self, path: &Path) -> GlacierResult<()> {
        self.validate()?;
        log::debug!("Writing container {} ({} steps)", path.display(), self.len());
        commit_with(path, |tmp| {
            let file = File::create(tmp)?;
            let mut zip = ZipWriter::new(file);
            self.write_members(&mut zip)?;
            zip.finish()?;
            Ok(())
        })
    }

    fn write_members<W: Write + Seek>(&self, zip: &mut ZipWriter<W>) -> GlacierResult<()> {
        let n = self.steps.len() as u64;
        let (rows, cols) = (self.grid.rows as u64, self.grid.cols as u64);
        for (name, array) in self.cubes() {
            let values: Vec<f32> = array.iter().copied().collect();
            write_npy(zip, name, &[n, rows, cols], &values)?;
        }

        let x: Vec<f64> = (0..self.grid.cols).map(|c| self.grid.x_center(c)).collect();
        let y: Vec<f64> = (0..self.grid.rows).map(|r| self.grid.y_center(r)).collect();
        write_npy(zip, "x", &[cols], &x)?;
        write_npy(zip, "y", &[rows], &y)?;

        let per_step_i64 =
            |f: &dyn Fn(&StepRecord) -> i64| -> Vec<i64> { self.steps.iter().map(f).collect() };
        let scene_1 = per_step_i64(&|s| s.scene_1_datetime.timestamp());
        let scene_2 = per_step_i64(&|s| s.scene_2_datetime.timestamp());
        write_npy(zip, "scene_1_datetime", &[n], &scene_1)?;
        write_npy(zip, "scene_2_datetime", &[n], &scene_2)?;
        write_npy(zip, "midpoint_datetime", &[n], &per_step_i64(&|s| s.midpoint().timestamp()))?;

        let per_step_f64 =
            |f: &dyn Fn(&StepRecord) -> f64| -> Vec<f64> { self.steps.iter().map(f).collect() };
        write_npy(zip, "baseline_days", &[n], &per_step_f64(&|s| s.baseline_days))?;
        let ice_percent = per_step_f64(&|s| s.ice_coverage * 100.0);
        write_npy(zip, "percent_ice_area_notnull", &[n], &ice_percent)?;
        write_npy(zip, "error_mean_vx", &[n], &per_step_f64(&|s| s.error.mean_vx))?;
        write_npy(zip, "error_std_vx", &[n], &per_step_f64(&|s| s.error.std_vx))?;
        write_npy(zip, "error_mean_vy", &[n], &per_step_f64(&|s| s.error.mean_vy))?;
        write_npy(zip, "error_std_vy", &[n], &per_step_f64(&|s| s.error.std_vy))?;
        write_npy(zip, "error_rmse_vv", &[n], &per_step_f64(&|s| s.error.rmse_vv))?;
        write_npy(zip, "rock_pixels", &[n], &per_step_f64(&|s| s.error.rock_pixels as f64))?;

        let flags: Vec<u8> = self
            .steps
            .iter()
            .map(|s| QualityFlag::to_bits(&s.quality_flags))
            .collect();
        write_npy(zip, "quality_flags", &[n], &flags)?;

        let attributes = Attributes {
            global: self.global_attributes.clone(),
            grid: self.grid.clone(),
            variables: variable_attributes(),
            steps: self
                .steps
                .iter()
                .map(|s| StepLabels {
                    field_id: s.field_id.clone(),
                    source: s.source,
                    period: s.period,
                    satellite_1: s.satellite_1.clone(),
                    satellite_2: s.satellite_2.clone(),
                    orbit_1: s.orbit_1.clone(),
                    orbit_2: s.orbit_2.clone(),
                    processing_version: s.processing_version.clone(),
                    offset_signature: s.offset_signature.clone(),
                })
                .collect(),
        };
        zip.start_file(ATTRIBUTES_MEMBER, member_options())?;
        serde_json::to_writer_pretty(&mut *zip, &attributes)?;
        Ok(())
    }

    /// Read a container written by [`ArrayContainer::write`]
    pub fn read(path: &Path) -> GlacierResult<ArrayContainer> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;

        let attributes: Attributes = {
            let member = archive.by_name(ATTRIBUTES_MEMBER)?;
            serde_json::from_reader(member)?
        };
        let n = attributes.steps.len();
        let grid = attributes.grid.clone();
        let shape = (n, grid.rows, grid.cols);

        let mut cube = |name: &str| -> GlacierResult<Array3<f32>> {
            let values: Vec<f32> = read_npy(&mut archive, name)?;
            Array3::from_shape_vec(shape, values)
                .map_err(|e| GlacierError::InvalidFormat(format!("{}: {}", name, e)))
        };
        let vx = cube("vx")?;
        let vy = cube("vy")?;
        let ux = cube("ux")?;
        let uy = cube("uy")?;

        let scene_1: Vec<i64> = read_npy(&mut archive, "scene_1_datetime")?;
        let scene_2: Vec<i64> = read_npy(&mut archive, "scene_2_datetime")?;
        let baseline: Vec<f64> = read_npy(&mut archive, "baseline_days")?;
        let coverage: Vec<f64> = read_npy(&mut archive, "percent_ice_area_notnull")?;
        let mean_vx: Vec<f64> = read_npy(&mut archive, "error_mean_vx")?;
        let std_vx: Vec<f64> = read_npy(&mut archive, "error_std_vx")?;
        let mean_vy: Vec<f64> = read_npy(&mut archive, "error_mean_vy")?;
        let std_vy: Vec<f64> = read_npy(&mut archive, "error_std_vy")?;
        let rmse_vv: Vec<f64> = read_npy(&mut archive, "error_rmse_vv")?;
        let rock: Vec<f64> = read_npy(&mut archive, "rock_pixels")?;
        let flags: Vec<u8> = read_npy(&mut archive, "quality_flags")?;

        let per_step = [
            scene_1.len(), scene_2.len(), baseline.len(), coverage.len(), mean_vx.len(),
            std_vx.len(), mean_vy.len(), std_vy.len(), rmse_vv.len(), rock.len(), flags.len(),
        ];
        if per_step.iter().any(|len| *len != n) {
            return Err(GlacierError::InvalidFormat(format!(
                "per-step arrays do not match {} steps in {}",
                n,
                path.display()
            )));
        }

        let mut steps = Vec::with_capacity(n);
        for (i, labels) in attributes.steps.into_iter().enumerate() {
            steps.push(StepRecord {
                field_id: labels.field_id,
                source: labels.source,
                period: labels.period,
                scene_1_datetime: timestamp(scene_1[i])?,
                scene_2_datetime: timestamp(scene_2[i])?,
                satellite_1: labels.satellite_1,
                satellite_2: labels.satellite_2,
                orbit_1: labels.orbit_1,
                orbit_2: labels.orbit_2,
                processing_version: labels.processing_version,
                offset_signature: labels.offset_signature,
                baseline_days: baseline[i],
                ice_coverage: coverage[i] / 100.0,
                error: ErrorStatistics {
                    mean_vx: mean_vx[i],
                    std_vx: std_vx[i],
                    mean_vy: mean_vy[i],
                    std_vy: std_vy[i],
                    rmse_vv: rmse_vv[i],
                    rock_pixels: rock[i] as usize,
                },
                quality_flags: QualityFlag::from_bits(flags[i]),
            });
        }

        Ok(ArrayContainer {
            grid,
            vx,
            vy,
            ux,
            uy,
            steps,
            global_attributes: attributes.global,
        })
    }
}

fn member_options() -> FileOptions {
    FileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn timestamp(seconds: i64) -> GlacierResult<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| GlacierError::InvalidFormat(format!("invalid timestamp {}", seconds)))
}

fn write_npy<W, T>(
    zip: &mut ZipWriter<W>,
    name: &str,
    shape: &[u64],
    values: &[T],
) -> GlacierResult<()>
where
    W: Write + Seek,
    T: npyz::AutoSerialize,
{
    zip.start_file(format!("{}.npy", name), member_options())?;
    let mut writer = npyz::WriteOptions::new()
        .default_dtype()
        .shape(shape)
        .writer(&mut *zip)
        .begin_nd()?;
    for value in values {
        writer.push(value)?;
    }
    writer.finish()?;
    Ok(())
}

fn read_npy<R, T>(archive: &mut ZipArchive<R>, name: &str) -> GlacierResult<Vec<T>>
where
    R: Read + Seek,
    T: npyz::Deserialize,
{
    let member = archive.by_name(&format!("{}.npy", name))?;
    let npy = npyz::NpyFile::new(member)?;
    Ok(npy.into_vec::<T>()?)
}
