//! Lifecycle events emitted by the orchestrator.
//!
//! The coordinator emits one event per state transition, in transition order.
//! Payloads are JSON objects carrying at least `run_id`, and `stage` for
//! stage-level events.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A run was accepted and is about to dispatch its first stages.
pub const RUN_STARTED: &str = "run.started";
/// A stage moved to `Running`.
pub const STAGE_RUNNING: &str = "stage.running";
/// A generation attempt failed and will be retried.
pub const STAGE_RETRYING: &str = "stage.retrying";
/// A stage passed validation and moved to `Completed`.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// A stage moved to `Failed`.
pub const STAGE_FAILED: &str = "stage.failed";
/// Every stage completed.
pub const RUN_COMPLETED: &str = "run.completed";
/// The run reached a terminal state with at least one incomplete stage.
pub const RUN_FAILED: &str = "run.failed";
/// A run-level error tore the run down.
pub const RUN_ABORTED: &str = "run.aborted";
