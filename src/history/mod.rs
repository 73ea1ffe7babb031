/// Run history: execution logs, diagnostic errors and checkpoints
///
/// All three stores share the engine's SQLite pool so that a suspension or a
/// forced termination can touch several tables in one transaction.

pub mod checkpoint;
pub mod error_log;
pub mod log;

pub use checkpoint::{Checkpoint, CheckpointReason, CheckpointStore, ParkedNode, ResumeMode};
pub use error_log::{ErrorRecorder, ExecutionError, Severity};
pub use log::{
    ExecutionLog, ExecutionLogStore, ExecutionStatus, ExecutionStepLog, RunAs, RunPage, RunQuery,
    StepError, StepStatus, Trigger, TriggerType,
};
