use crate::config::ProjectInfo;
use crate::core::field_correction::CorrectedField;
use crate::io::container::ArrayContainer;
use crate::io::workspace::{ArtifactKind, UnitWorkspace};
use crate::types::{GlacierError, GlacierResult, GridSpec, Period, Raster, Source};
use chrono::{DateTime, Utc};
use ndarray::{stack, Array3, ArrayView2, Axis};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Descriptive metadata of one source stack
#[derive(Debug, Clone, PartialEq)]
pub struct StackMetadata {
    pub processing_versions: Vec<String>,
    pub epsg: u32,
    pub units: String,
    pub created: DateTime<Utc>,
}

/// Time-ordered corrected fields of one (unit, source, period)
#[derive(Debug, Clone)]
pub struct SourceStack {
    pub unit: String,
    pub source: Source,
    pub period: Period,
    pub container: ArrayContainer,
    pub metadata: StackMetadata,
    /// Fields left out because they were not on the stack grid
    pub off_grid: Vec<String>,
}

impl SourceStack {
    pub fn len(&self) -> usize {
        self.container.len()
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }

    /// `<S2|L8>_<unit>_v<version>.npz`
    pub fn file_name(&self, version: &str) -> String {
        format!("{}_{}_v{}.npz", self.source.prefix(), self.unit, version)
    }
}

/// Per-source stacker
pub struct SourceStacker;

impl SourceStacker {
    /// Grid shared by most fields, first seen on ties
    fn dominant_grid(fields: &[CorrectedField]) -> Option<GridSpec> {
        let mut counts: Vec<(GridSpec, usize)> = Vec::new();
        for field in fields {
            match counts.iter_mut().find(|(g, _)| g.is_compatible(&field.grid)) {
                Some((_, n)) => *n += 1,
                None => counts.push((field.grid.clone(), 1)),
            }
        }
        let best = counts.iter().map(|(_, n)| *n).max()?;
        counts.into_iter().find(|(_, n)| *n == best).map(|(g, _)| g)
    }

    fn cube(
        fields: &[CorrectedField],
        pick: impl Fn(&CorrectedField) -> &Raster,
    ) -> GlacierResult<Array3<f32>> {
        let views: Vec<ArrayView2<'_, f32>> = fields.iter().map(|f| pick(f).view()).collect();
        stack(Axis(0), &views).map_err(|e| GlacierError::GridMismatch(e.to_string()))
    }

    /// Sort by (scene 1, scene 2) and assemble the stack on one grid.
    ///
    /// Fails with `EmptySource` when no corrected field exists for the source.
    pub fn assemble(
        unit: &str,
        source: Source,
        period: Period,
        mut fields: Vec<CorrectedField>,
        project: &ProjectInfo,
    ) -> GlacierResult<SourceStack> {
        fields.retain(|f| f.source() == source);
        if fields.is_empty() {
            return Err(GlacierError::EmptySource {
                unit: unit.to_string(),
                sensor: source,
            });
        }
        log::info!("📚 Stacking {} {} fields for {} ({})", fields.len(), source, unit, period);

        let grid = Self::dominant_grid(&fields).ok_or_else(|| GlacierError::EmptySource {
            unit: unit.to_string(),
            sensor: source,
        })?;
        let (on_grid, off): (Vec<CorrectedField>, Vec<CorrectedField>) =
            fields.into_iter().partition(|f| f.grid.is_compatible(&grid));
        let off_grid: Vec<String> = off.into_iter().map(|f| f.record.field_id).collect();
        for id in &off_grid {
            log::warn!("   {} is not on the stack grid, left out", id);
        }

        let mut fields = on_grid;
        fields.sort_by(|a, b| {
            (a.record.datetime_1, a.record.datetime_2, &a.record.field_id)
                .cmp(&(b.record.datetime_1, b.record.datetime_2, &b.record.field_id))
        });

        let processing_versions: Vec<String> = fields
            .iter()
            .map(|f| f.record.processing_1.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let created = Utc::now();

        let mut global = BTreeMap::new();
        global.insert("unit".to_string(), unit.to_string());
        global.insert("source".to_string(), source.to_string());
        global.insert("period".to_string(), period.to_string());
        global.insert("processing_versions".to_string(), processing_versions.join(","));
        global.insert("projection".to_string(), format!("EPSG:{}", grid.epsg));
        global.insert("units".to_string(), "m/d".to_string());
        global.insert("date_created".to_string(), created.to_rfc3339());
        global.insert("title".to_string(), project.title.clone());
        global.insert("institution".to_string(), project.institution.clone());
        global.insert("contact".to_string(), project.contact.clone());
        global.insert("references".to_string(), project.references.clone());

        let container = ArrayContainer {
            grid: grid.clone(),
            vx: Self::cube(&fields, |f| &f.vx)?,
            vy: Self::cube(&fields, |f| &f.vy)?,
            ux: Self::cube(&fields, |f| &f.ux)?,
            uy: Self::cube(&fields, |f| &f.uy)?,
            steps: fields.iter().map(CorrectedField::step_record).collect(),
            global_attributes: global,
        };
        container.validate()?;

        Ok(SourceStack {
            unit: unit.to_string(),
            source,
            period,
            container,
            metadata: StackMetadata {
                processing_versions,
                epsg: grid.epsg,
                units: "m/d".to_string(),
                created,
            },
            off_grid,
        })
    }

    /// Write the stack container into the unit's container directory
    pub fn write(
        stack: &SourceStack,
        workspace: &UnitWorkspace,
        version: &str,
    ) -> GlacierResult<PathBuf> {
        let path = workspace.dir(ArtifactKind::Containers)?.join(stack.file_name(version));
        stack.container.write(&path)?;
        log::info!("   Wrote {} ({} steps)", path.display(), stack.len());
        Ok(path)
    }
}
