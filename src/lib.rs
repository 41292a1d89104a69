pub mod config;
pub mod error;
pub mod extract;
pub mod merge;
pub mod optimize;
pub mod pipeline;
pub mod schema;
pub mod state;
pub mod table;
pub mod transform;

pub use config::{ApiConfig, PipelineConfig, TierPaths};
pub use error::{LakeError, Result};
pub use merge::{DuplicatePolicy, LoadOutcome, MergeEngine};
pub use optimize::{MaintenanceReport, StorageOptimizer};
pub use pipeline::{ExtractionWindow, Orchestrator, RunReport, RunStatus, Stage};
pub use state::StateTracker;
pub use table::{DeltaTableStore, TableStore};
