//! State synchronization
//!
//! Snapshot broadcast and ingestion, smoothing of remote players, and the
//! buffer of locally predicted actions.

mod interpolation;
mod prediction;
mod snapshot;

pub use interpolation::Smoother;
pub use prediction::{PendingAction, PredictionBuffer, PredictionStats};
pub use snapshot::{IngestOutcome, StateSyncEngine, SyncConfig, SyncStats};
