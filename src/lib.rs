/// Mechaflow: durable automation flow engine
///
/// This library walks flow graphs of typed nodes with parallel branches,
/// joins, loops and boundary timers; suspends runs to durable checkpoints and
/// resumes them; gates admission per flow; and triggers flows on cron schedules.

// Core configuration and setup
pub mod config;

// SQLite pool and schema shared by every store
pub mod database;

// Error types with stable codes
pub mod error;

// Flow definitions, validation, storage and the hot-reload registry
pub mod flow;

// Execution logs, error records and checkpoints
pub mod history;

// Execution engine, actions, admission control and scheduler
pub mod runtime;

// Management and run control facade
pub mod service;

// Application wiring and daemon entry
pub mod app;

// Re-export commonly used types for external consumers
pub use app::{create_app, start, App};
pub use error::{ActionError, FlowError, FlowResult};
pub use flow::{Edge, FlowDefinition, Node, NodeKind};
pub use history::{ExecutionLog, ExecutionStatus, Trigger};
pub use runtime::{Engine, ExecutionContext, Scheduler};
pub use service::{FlowService, TriggerResponse};
