//! Run orchestration for pricewatch.
//!
//! One [`pipeline`] per price source walks the shared [`ledger`]
//! concurrently; the [`supervisor`] seeds, joins and consolidates a run, and
//! the [`controller`] exposes start/pause/resume/reset to callers.

pub mod consolidator;
pub mod controller;
pub mod gate;
pub mod input;
pub mod ledger;
pub mod pipeline;
pub mod progress;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use consolidator::Consolidator;
pub use controller::{Controller, ControllerStatus};
pub use gate::PauseGate;
pub use input::{load_items, parse_items};
pub use ledger::{Ledger, SourceStats};
pub use pipeline::PipelineReport;
pub use progress::{EventKind, LogLevel, ProgressChannel, ProgressEvent, ProgressSubscription};
pub use supervisor::{PreparedRun, RunConfig, RunContext, RunOutcome, Supervisor};
