/*!
 * Empirical orbit offset estimation
 *
 * Builds the same-track reference ("a priori") velocity field of a unit and,
 * for every cross-track orbit-pair signature with enough members, the median
 * displacement bias of that pair relative to the reference:
 *
 *   offset(sig) = median_i( orientation_i * (v_i - v_ref) * baseline_i )
 *
 * Offsets are in displacement units (metres) so pairs with different
 * temporal baselines can share one estimate. Fields are divided by their own
 * baseline again when the offset is applied.
 */

use crate::config::EstimationConfig;
use crate::core::statistics::{self, PixelStack};
use crate::io::field_store::RawField;
use crate::io::preview;
use crate::io::raster::RasterIo;
use crate::io::workspace::{commit_with, ArtifactKind, UnitWorkspace};
use crate::types::{
    GlacierError, GlacierResult, GridSpec, OrbitPairRecord, OrbitPairSignature, Orientation, Raster,
    Source,
};
use ndarray::{Array2, ArrayView2, Zip};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Pixel-wise median of same-track fields, per component
#[derive(Debug, Clone)]
pub struct ReferenceField {
    pub dx: Raster,
    pub dy: Raster,
    pub dmag: Raster,
    /// Degrees anticlockwise from +x
    pub flow_direction: Raster,
    /// Finite same-track samples per pixel
    pub counts: Array2<u32>,
    pub grid: GridSpec,
    pub members: usize,
}

/// Median cross-track bias for one signature, metres
#[derive(Debug, Clone)]
pub struct OffsetField {
    pub signature: OrbitPairSignature,
    pub dx: Raster,
    pub dy: Raster,
    pub mad_dx: Raster,
    pub mad_dy: Raster,
    pub members: Vec<String>,
    pub grid: GridSpec,
}

/// A cross-track group below the sample threshold
#[derive(Debug, Clone, PartialEq)]
pub struct InsufficientSamplesWarning {
    pub signature: OrbitPairSignature,
    pub count: usize,
    pub threshold: usize,
    pub members: Vec<String>,
}

impl InsufficientSamplesWarning {
    pub fn to_error(&self) -> GlacierError {
        GlacierError::InsufficientSamples {
            signature: self.signature.to_string(),
            count: self.count,
            threshold: self.threshold,
        }
    }
}

/// Estimation result for one unit and period
#[derive(Debug, Clone, Default)]
pub struct OffsetEstimate {
    /// `None` when no correction-enabled source has fields
    pub reference: Option<Arc<ReferenceField>>,
    pub offsets: BTreeMap<OrbitPairSignature, OffsetField>,
    pub warnings: Vec<InsufficientSamplesWarning>,
    /// Correction fields left out because their grid differs from the reference grid
    pub grid_rejects: Vec<String>,
}

impl OffsetEstimate {
    pub fn offset_for(&self, signature: &OrbitPairSignature) -> Option<&OffsetField> {
        self.offsets.get(signature)
    }
}

/// Empirical offset estimator
pub struct OffsetEstimator;

impl OffsetEstimator {
    /// Reference field from same-track fields sharing one grid
    pub fn reference(fields: &[&RawField], min_samples: usize) -> GlacierResult<ReferenceField> {
        let first = fields.first().ok_or_else(|| GlacierError::CriticalStage {
            stage: "offset_estimation".to_string(),
            reason: "no same-track fields to build a reference from".to_string(),
        })?;
        let grid = first.grid.clone();

        let dx_layers: Vec<ArrayView2<'_, f32>> = fields.iter().map(|f| f.dx.view()).collect();
        let dy_layers: Vec<ArrayView2<'_, f32>> = fields.iter().map(|f| f.dy.view()).collect();
        let magnitudes: Vec<Raster> = fields
            .iter()
            .map(|f| statistics::magnitude(&f.dx, &f.dy))
            .collect();
        let mag_layers: Vec<ArrayView2<'_, f32>> = magnitudes.iter().map(|m| m.view()).collect();

        let shape_error =
            || GlacierError::GridMismatch("same-track fields differ in shape".to_string());
        let dx = statistics::pixelwise_median(&dx_layers, min_samples).ok_or_else(shape_error)?;
        let dy = statistics::pixelwise_median(&dy_layers, min_samples).ok_or_else(shape_error)?;
        let dmag = statistics::pixelwise_median(&mag_layers, min_samples).ok_or_else(shape_error)?;

        // A pixel is valid only when both components are
        let mut ref_dx = dx.median;
        let mut ref_dy = dy.median;
        Zip::from(&mut ref_dx).and(&mut ref_dy).for_each(|x, y| {
            if !x.is_finite() || !y.is_finite() {
                *x = f32::NAN;
                *y = f32::NAN;
            }
        });
        let counts = Zip::from(&dx.counts).and(&dy.counts).map_collect(|a, b| (*a).min(*b));
        let flow_direction = statistics::flow_direction(&ref_dx, &ref_dy);

        let valid = ref_dx.iter().filter(|v| v.is_finite()).count();
        log::info!(
            "   Reference from {} same-track fields: {}/{} pixels valid (min {} samples)",
            fields.len(),
            valid,
            ref_dx.len(),
            min_samples
        );

        Ok(ReferenceField {
            dx: ref_dx,
            dy: ref_dy,
            dmag: dmag.median,
            flow_direction,
            counts,
            grid,
            members: fields.len(),
        })
    }

    /// Offset for one cross-track group against an immutable reference
    pub fn offset_for_group(
        signature: &OrbitPairSignature,
        members: &[(&RawField, Orientation, f64)],
        reference: &ReferenceField,
        median_filter: bool,
    ) -> GlacierResult<OffsetField> {
        let displacement =
            |values: &Raster, reference: &Raster, sign: f32, baseline: f32| -> Raster {
                Zip::from(values)
                    .and(reference)
                    .map_collect(|v, r| sign * (v - r) * baseline)
            };

        let mut dx_diffs = Vec::with_capacity(members.len());
        let mut dy_diffs = Vec::with_capacity(members.len());
        for (field, orientation, baseline_days) in members {
            if field.dx.dim() != reference.dx.dim() {
                return Err(GlacierError::GridMismatch(format!(
                    "{} does not match the reference grid",
                    field.id.name
                )));
            }
            let sign = orientation.sign();
            let baseline = *baseline_days as f32;
            dx_diffs.push(displacement(&field.dx, &reference.dx, sign, baseline));
            dy_diffs.push(displacement(&field.dy, &reference.dy, sign, baseline));
        }

        let reduce = |diffs: &[Raster]| -> GlacierResult<PixelStack> {
            let views: Vec<ArrayView2<'_, f32>> = diffs.iter().map(|d| d.view()).collect();
            statistics::pixelwise_median_mad(&views, 1)
                .ok_or_else(|| GlacierError::Processing(format!("empty group {}", signature)))
        };
        let dx = reduce(&dx_diffs)?;
        let dy = reduce(&dy_diffs)?;

        let (mut off_dx, mut off_dy) = (dx.median, dy.median);
        if median_filter {
            off_dx = statistics::median_filter_3x3(&off_dx);
            off_dy = statistics::median_filter_3x3(&off_dy);
        }
        let nan_like = || Array2::from_elem(reference.dx.dim(), f32::NAN);

        Ok(OffsetField {
            signature: signature.clone(),
            dx: off_dx,
            dy: off_dy,
            mad_dx: dx.mad.unwrap_or_else(nan_like),
            mad_dy: dy.mad.unwrap_or_else(nan_like),
            members: members.iter().map(|(f, _, _)| f.id.name.clone()).collect(),
            grid: reference.grid.clone(),
        })
    }

    /// Reference plus one offset per sufficiently sampled cross-track signature.
    ///
    /// `records` are the period's selected records; fields missing from
    /// `fields` were not loadable and are ignored.
    pub fn estimate(
        records: &[&OrbitPairRecord],
        fields: &BTreeMap<String, RawField>,
        config: &EstimationConfig,
        correction_enabled: &dyn Fn(Source) -> bool,
    ) -> GlacierResult<OffsetEstimate> {
        log::info!("📐 Estimating orbit offsets from {} records", records.len());
        let loaded: Vec<(&OrbitPairRecord, &RawField)> = records
            .iter()
            .filter_map(|r| fields.get(&r.field_id).map(|f| (*r, f)))
            .collect();
        if loaded.is_empty() {
            return Err(GlacierError::CriticalStage {
                stage: "offset_estimation".to_string(),
                reason: "no loadable raw fields".to_string(),
            });
        }

        let correctable: Vec<(&OrbitPairRecord, &RawField)> = loaded
            .into_iter()
            .filter(|(r, _)| correction_enabled(r.source))
            .collect();
        if correctable.is_empty() {
            log::info!("   No correction-enabled fields; offsets not estimated");
            return Ok(OffsetEstimate::default());
        }

        let same_track: Vec<&RawField> = correctable
            .iter()
            .filter(|(r, _)| r.is_same_track())
            .map(|(_, f)| *f)
            .collect();
        let grid = same_track
            .first()
            .map(|f| f.grid.clone())
            .ok_or_else(|| GlacierError::CriticalStage {
                stage: "offset_estimation".to_string(),
                reason: "no same-track fields among correction-enabled sources".to_string(),
            })?;

        let mut grid_rejects = Vec::new();
        let on_grid = |f: &RawField| f.grid.is_compatible(&grid);
        let same_track: Vec<&RawField> = same_track
            .into_iter()
            .filter(|f| {
                let ok = on_grid(*f);
                if !ok {
                    log::warn!("   {} is off the reference grid, left out", f.id.name);
                }
                ok
            })
            .collect();
        let reference = Arc::new(Self::reference(&same_track, config.reference_min_samples)?);

        let mut groups: BTreeMap<OrbitPairSignature, Vec<(&RawField, Orientation, f64)>> =
            BTreeMap::new();
        for (record, field) in correctable.iter().filter(|(r, _)| !r.is_same_track()) {
            if !on_grid(*field) {
                log::warn!("   {} is off the reference grid, left out", field.id.name);
                grid_rejects.push(field.id.name.clone());
                continue;
            }
            let (signature, orientation) = record.signature();
            groups
                .entry(signature)
                .or_default()
                .push((*field, orientation, record.baseline_days));
        }
        for field in correctable.iter().filter(|(r, _)| r.is_same_track()).map(|(_, f)| f) {
            if !on_grid(*field) {
                grid_rejects.push(field.id.name.clone());
            }
        }

        let mut offsets = BTreeMap::new();
        let mut warnings = Vec::new();
        for (signature, members) in groups {
            if members.len() < config.min_pair_samples {
                let warning = InsufficientSamplesWarning {
                    signature: signature.clone(),
                    count: members.len(),
                    threshold: config.min_pair_samples,
                    members: members.iter().map(|(f, _, _)| f.id.name.clone()).collect(),
                };
                log::warn!("   ⚠️  {}", warning.to_error());
                warnings.push(warning);
                continue;
            }
            log::debug!("   Offset {} from {} fields", signature, members.len());
            let filtered = config.offset_median_filter;
            let offset = Self::offset_for_group(&signature, &members, &reference, filtered)?;
            offsets.insert(signature, offset);
        }

        log::info!(
            "   {} offset fields, {} signatures below {} samples",
            offsets.len(),
            warnings.len(),
            config.min_pair_samples
        );

        Ok(OffsetEstimate {
            reference: Some(reference),
            offsets,
            warnings,
            grid_rejects,
        })
    }

    /// Write reference and offset rasters plus offset magnitude previews
    pub fn persist(
        estimate: &OffsetEstimate,
        unit: &str,
        workspace: &UnitWorkspace,
        previews: bool,
    ) -> GlacierResult<Vec<PathBuf>> {
        let dir = workspace.dir(ArtifactKind::Orbits)?;
        let mut written = Vec::new();
        let mut write = |name: String, raster: &Raster, grid: &GridSpec| -> GlacierResult<()> {
            let path = dir.join(name);
            commit_with(&path, |tmp| RasterIo::write_f32(tmp, raster, grid))?;
            written.push(path);
            Ok(())
        };

        if let Some(reference) = &estimate.reference {
            let grid = &reference.grid;
            write(format!("{}_median_orbitmatch_dx.tif", unit), &reference.dx, grid)?;
            write(format!("{}_median_orbitmatch_dy.tif", unit), &reference.dy, grid)?;
            write(format!("{}_median_orbitmatch_dmag.tif", unit), &reference.dmag, grid)?;
            let flowdir = format!("{}_median_orbitmatch_flowdir.tif", unit);
            write(flowdir, &reference.flow_direction, grid)?;
        }
        for (signature, offset) in &estimate.offsets {
            let token = signature.token();
            write(format!("{}_median_offset_{}_dx.tif", unit, token), &offset.dx, &offset.grid)?;
            write(format!("{}_median_offset_{}_dy.tif", unit, token), &offset.dy, &offset.grid)?;
        }
        if previews {
            for (signature, offset) in &estimate.offsets {
                let name = format!("{}_median_offset_{}_dmag.png", unit, signature.token());
                let path = dir.join(name);
                preview::write_png(&path, &statistics::magnitude(&offset.dx, &offset.dy))?;
                written.push(path);
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::identifier::FieldIdentifier;
    use crate::core::orbit_index::OrbitIndexer;
    use crate::types::GeoTransform;
    use approx::assert_relative_eq;

    fn grid() -> GridSpec {
        GridSpec {
            geo_transform: GeoTransform::from_gdal([0.0, 100.0, 0.0, 0.0, 0.0, -100.0]),
            rows: 3,
            cols: 3,
            epsg: 3413,
        }
    }

    fn field(day: u32, orbit1: &str, orbit2: &str, vx: f32) -> (OrbitPairRecord, RawField) {
        let name = format!(
            "S2A_MSIL2A_202007{:02}T120000_N0214_R{}__S2B_MSIL2A_202007{:02}T120000_N0214_R{}",
            day,
            orbit1,
            day + 10,
            orbit2
        );
        let id = FieldIdentifier::parse(&name).unwrap();
        let record = OrbitIndexer::record_for(&id);
        let dx = Array2::from_elem((3, 3), vx);
        let dy = Array2::from_elem((3, 3), 0.5f32);
        (record, RawField::new(id, dx, dy, grid()).unwrap())
    }

    fn run(entries: Vec<(OrbitPairRecord, RawField)>, min_pair_samples: usize) -> OffsetEstimate {
        let records: Vec<OrbitPairRecord> = entries.iter().map(|(r, _)| r.clone()).collect();
        let fields: BTreeMap<String, RawField> = entries
            .into_iter()
            .map(|(r, f)| (r.field_id, f))
            .collect();
        let refs: Vec<&OrbitPairRecord> = records.iter().collect();
        let config = EstimationConfig {
            min_pair_samples,
            reference_min_samples: 3,
            offset_median_filter: true,
        };
        OffsetEstimator::estimate(&refs, &fields, &config, &|_: Source| true).unwrap()
    }

    #[test]
    fn test_one_offset_for_sufficient_group() {
        let mut entries: Vec<_> = (1..=5).map(|d| field(d, "083", "083", 1.0)).collect();
        entries.extend((1..=3).map(|d| field(d, "040", "083", 1.2)));
        let estimate = run(entries, 3);

        assert_eq!(estimate.offsets.len(), 1);
        assert!(estimate.warnings.is_empty());
        let offset = estimate.offsets.values().next().unwrap();
        assert_eq!(offset.signature.token(), "R040_R083");
        // (1.2 - 1.0) m/d over a 10 day baseline
        assert_relative_eq!(offset.dx[[1, 1]], 2.0, epsilon = 1e-4);
        assert_relative_eq!(offset.dy[[1, 1]], 0.0, epsilon = 1e-6);
        assert_relative_eq!(offset.mad_dx[[1, 1]], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_small_group_warns_without_offset() {
        let mut entries: Vec<_> = (1..=5).map(|d| field(d, "083", "083", 1.0)).collect();
        entries.extend((1..=2).map(|d| field(d, "040", "083", 1.2)));
        let estimate = run(entries, 3);

        assert!(estimate.offsets.is_empty());
        assert_eq!(estimate.warnings.len(), 1);
        assert_eq!(estimate.warnings[0].count, 2);
        assert_eq!(estimate.warnings[0].members.len(), 2);
    }

    #[test]
    fn test_reversed_orbits_share_signature_with_negated_difference() {
        let mut entries: Vec<_> = (1..=5).map(|d| field(d, "083", "083", 1.0)).collect();
        entries.push(field(1, "040", "083", 1.2));
        entries.push(field(2, "040", "083", 1.2));
        entries.push(field(3, "083", "040", 0.8));
        let estimate = run(entries, 3);

        assert_eq!(estimate.offsets.len(), 1);
        let offset = estimate.offsets.values().next().unwrap();
        assert_relative_eq!(offset.dx[[0, 0]], 2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_reference_requires_min_samples() {
        let (_, mut a) = field(1, "083", "083", 1.0);
        let (_, b) = field(2, "083", "083", 3.0);
        let (_, c) = field(3, "083", "083", 2.0);
        a.dx[[0, 0]] = f32::NAN;
        let reference = OffsetEstimator::reference(&[&a, &b, &c], 3).unwrap();
        assert!(reference.dx[[0, 0]].is_nan());
        assert!(reference.dy[[0, 0]].is_nan());
        assert_eq!(reference.dx[[1, 1]], 2.0);
        assert_eq!(reference.counts[[0, 0]], 2);
    }

    #[test]
    fn test_estimation_is_deterministic() {
        let build = || {
            let mut entries: Vec<_> =
                (1..=5).map(|d| field(d, "083", "083", d as f32 * 0.1)).collect();
            entries.extend((1..=4).map(|d| field(d, "040", "083", 1.0 + d as f32 * 0.05)));
            run(entries, 3)
        };
        let (a, b) = (build(), build());
        for (sig, offset) in &a.offsets {
            let other = &b.offsets[sig];
            assert!(offset
                .dx
                .iter()
                .zip(other.dx.iter())
                .all(|(x, y)| x.to_bits() == y.to_bits()));
        }
    }

    #[test]
    fn test_no_same_track_is_critical() {
        let entries: Vec<_> = (1..=3).map(|d| field(d, "040", "083", 1.2)).collect();
        let records: Vec<OrbitPairRecord> = entries.iter().map(|(r, _)| r.clone()).collect();
        let fields: BTreeMap<String, RawField> =
            entries.into_iter().map(|(r, f)| (r.field_id, f)).collect();
        let refs: Vec<&OrbitPairRecord> = records.iter().collect();
        let config = EstimationConfig::default();
        let result = OffsetEstimator::estimate(&refs, &fields, &config, &|_: Source| true);
        assert!(matches!(result, Err(GlacierError::CriticalStage { .. })));
    }
}
