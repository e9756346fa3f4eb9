//! Orbit metadata indexing: one classified record per raw field name.

use crate::io::boundary::{persist_boundary, BoundaryProvider, UnitBoundary};
use crate::io::identifier::FieldIdentifier;
use crate::io::orbit_table;
use crate::io::workspace::{ArtifactKind, UnitWorkspace};
use crate::types::{GlacierError, GlacierResult, OrbitPairRecord, PeriodWindow, Source};
use std::path::PathBuf;

/// Outcome of indexing one unit for one period
#[derive(Debug, Clone)]
pub struct OrbitIndex {
    pub unit: String,
    /// Every parseable field, whether or not it falls inside the period
    pub records: Vec<OrbitPairRecord>,
    /// Names that failed to parse, with the reason
    pub malformed: Vec<(String, String)>,
    /// Indices into `records` of the fields inside the period window
    pub selected: Vec<usize>,
    /// Parseable fields outside the period window
    pub out_of_range: usize,
    pub boundary: UnitBoundary,
}

impl OrbitIndex {
    pub fn selected_records(&self) -> impl Iterator<Item = &OrbitPairRecord> {
        self.selected.iter().map(move |i| &self.records[*i])
    }

    pub fn selected_count(&self) -> usize {
        self.selected.len()
    }

    /// No field falls inside the period window
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

/// Orbit metadata indexer
pub struct OrbitIndexer;

impl OrbitIndexer {
    /// Build the classified record of a parsed field
    pub fn record_for(id: &FieldIdentifier) -> OrbitPairRecord {
        let window = id.window();
        OrbitPairRecord {
            field_id: id.name.clone(),
            source: id.source,
            satellite_1: id.scene1.satellite.clone(),
            satellite_2: id.scene2.satellite.clone(),
            datetime_1: id.scene1.datetime,
            datetime_2: id.scene2.datetime,
            orbit_1: id.scene1.orbit.0.clone(),
            orbit_2: id.scene2.orbit.0.clone(),
            processing_1: id.scene1.processing_version.clone(),
            processing_2: id.scene2.processing_version.clone(),
            baseline_days: window.baseline_days(),
            midpoint: window.midpoint(),
            classification: id.track_class(),
        }
    }

    /// Parse and classify every name; unparseable names are returned separately
    pub fn classify(names: &[(Source, String)]) -> (Vec<OrbitPairRecord>, Vec<(String, String)>) {
        let mut records = Vec::with_capacity(names.len());
        let mut malformed = Vec::new();
        for (source, name) in names {
            match FieldIdentifier::parse_for(*source, name) {
                Ok(id) => records.push(Self::record_for(&id)),
                Err(GlacierError::MalformedIdentifier { reason, .. }) => {
                    log::warn!("Skipping malformed field name {}: {}", name, reason);
                    malformed.push((name.clone(), reason));
                }
                Err(e) => {
                    log::warn!("Skipping field {}: {}", name, e);
                    malformed.push((name.clone(), e.to_string()));
                }
            }
        }
        (records, malformed)
    }

    /// Index the fields of `unit`, selecting those inside `window`.
    ///
    /// Fails when the boundary is unavailable. A window holding no field
    /// yields an empty index; the caller decides what an empty period means.
    pub fn build(
        unit: &str,
        names: &[(Source, String)],
        window: &PeriodWindow,
        boundaries: &dyn BoundaryProvider,
    ) -> GlacierResult<OrbitIndex> {
        log::info!(
            "🛰️  Indexing {} field names for {} ({})",
            names.len(),
            unit,
            window.period
        );
        let boundary = boundaries.boundary(unit).map_err(|e| GlacierError::CriticalStage {
            stage: "orbit_indexing".to_string(),
            reason: format!("boundary unavailable: {}", e),
        })?;

        let (records, malformed) = Self::classify(names);
        let selected: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| window.contains(&r.window()))
            .map(|(i, _)| i)
            .collect();
        let out_of_range = records.len() - selected.len();

        log::info!(
            "   {} records ({} malformed, {} outside {} to {})",
            records.len(),
            malformed.len(),
            out_of_range,
            window.start.format("%Y-%m-%d"),
            window.end.format("%Y-%m-%d")
        );

        if selected.is_empty() {
            log::warn!("   No parseable fields inside the {} window", window.period);
        }

        Ok(OrbitIndex {
            unit: unit.to_string(),
            records,
            malformed,
            selected,
            out_of_range,
            boundary,
        })
    }

    /// Write the orbit-pair table and the boundary association
    pub fn persist(index: &OrbitIndex, workspace: &UnitWorkspace) -> GlacierResult<Vec<PathBuf>> {
        let table = orbit_table::table_path(&workspace.dir(ArtifactKind::Orbits)?, &index.unit);
        orbit_table::write_table(&table, &index.records)?;
        let boundary = persist_boundary(&index.boundary, &workspace.dir(ArtifactKind::Boundary)?)?;
        Ok(vec![table, boundary])
    }
}
