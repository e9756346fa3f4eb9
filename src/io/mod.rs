pub mod boundary;
pub mod container;
pub mod failure_log;
pub mod field_store;
pub mod identifier;
pub mod masks;
pub mod orbit_table;
pub mod preview;
pub mod raster;
pub mod workspace;

pub use boundary::{BoundaryProvider, JsonBoundaryProvider, StaticBoundaryProvider, UnitBoundary};
pub use container::{ArrayContainer, StepRecord};
pub use failure_log::{FailureEntry, FailureLog};
pub use field_store::{GeoTiffFieldStore, MemoryFieldStore, RawField, RawFieldStore};
pub use identifier::FieldIdentifier;
pub use masks::{MaskCache, MaskSet};
pub use raster::RasterIo;
pub use workspace::{ArtifactKind, UnitWorkspace};
