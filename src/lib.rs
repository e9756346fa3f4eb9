//! glacierflow: orbit-corrected, multi-source glacier surface velocity time series
//!
//! Raw Sentinel-2 and Landsat displacement fields are indexed by orbit pair,
//! corrected for the empirical cross-track geometric offset, masked to the
//! glacier, stacked per source and merged into one self-describing container
//! per unit.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use config::{CoverageFilter, Criticality, OutputLayout, PipelineConfig};
pub use core::{BatchReport, ChainDriver, DeliveryProduct, UnitReport, UnitState};
pub use io::{ArrayContainer, FieldIdentifier, RawFieldStore};
pub use types::{GlacierError, GlacierResult, Period, Source};
