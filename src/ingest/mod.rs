//! Resumable collection: per-key state, raw and daily archives, slice logs,
//! and the orchestrator tying them to the fetch layer.

pub mod archive;
pub mod orchestrator;
pub mod slice;
pub mod state;
pub mod summary;

pub use orchestrator::{IngestError, IngestOrchestrator, plan_collection};
pub use slice::{ErrorBreakdown, SliceLog, load_slice_logs};
pub use state::{CollectionState, KeyStatus};
pub use summary::RunSummary;
