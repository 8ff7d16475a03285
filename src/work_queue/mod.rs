//! Per-stage work selection and processing.
//!
//! Both the OCR and the correction stage follow the same pattern:
//! reconcile the ledger with the artifact store, pull a batch of pending
//! documents, process each one, record the outcome, repeat. The ledger is
//! recomputed from (artifact existence) x (ledger status) on every run, never
//! carried in memory between runs.

mod error;
pub mod pipeline;
pub mod runner;
pub mod tracker;

pub use error::{RunnerError, TrackerError};
pub use pipeline::{ItemError, RunMode, StageEvent, StageProcessor};
pub use runner::{StageRunReport, StageRunner};
pub use tracker::ItemTracker;
