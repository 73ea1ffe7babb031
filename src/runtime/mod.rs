/// Runtime Execution Engine
///
/// This module walks flow graphs and keeps runs durable. It handles:
/// - Node actions and their collaborators (records, HTTP, scripts, connectors)
/// - Graph walking with parallel branches, joins, loops and boundary timers
/// - Suspension to checkpoints and resumption
/// - Admission control per lock key
/// - The cron scheduler and periodic sweeps

pub mod actions;
pub mod collaborators;
pub mod concurrency;
pub mod context;
pub mod engine;
pub mod expression;
pub mod scheduler;

// Segment walker, driven only by the engine
mod walker;

// Re-export main types
pub use actions::{ActionOutcome, ActionRegistry, NextEdge, NodeAction};
pub use collaborators::Collaborators;
pub use concurrency::{Admission, ConcurrencyController, SlotSnapshot};
pub use context::{ActionContext, ExecutionContext, SubflowRunner};
pub use engine::{AdmittedRun, Engine, ReconcileReport, RunOutcome};
pub use scheduler::{ScheduleFire, ScheduleState, ScheduleStatus, Scheduler};
