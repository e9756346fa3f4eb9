//! Processing stages of the orbit-correction chain

pub mod chain;
pub mod field_correction;
pub mod merge;
pub mod offset_estimation;
pub mod orbit_index;
pub mod source_stack;
pub mod statistics;

// Re-export main types
pub use chain::{BatchReport, ChainDriver, OutcomeKind, Stage, StageOutcome, UnitReport, UnitState};
pub use field_correction::{CorrectedField, CorrectionSummary, Exclusion, FieldCorrector};
pub use merge::{
    ConcatenateReconciler, DeliveryProduct, MergeOrchestrator, ProductCoverage, Reconciler,
};
pub use offset_estimation::{OffsetEstimate, OffsetEstimator, OffsetField, ReferenceField};
pub use orbit_index::{OrbitIndex, OrbitIndexer};
pub use source_stack::{SourceStack, SourceStacker};
