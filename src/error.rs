/// Error types for flow execution
///
/// Every error carries a stable snake_case code. Codes end up in step logs,
/// execution error records and admission failures, so they are part of the
/// persisted contract and must not be renamed casually.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the engine and the service layer
///
/// Flow-logical failures (a node failed, no edge matched) do not show up here:
/// they end the run with status `failed` and are recorded in the execution log.
/// This enum covers what the caller of `execute`/`trigger_flow` sees directly.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("flow '{0}' is disabled")]
    FlowDisabled(String),

    #[error("flow '{name}' is not active (status: {status})")]
    FlowNotActive { name: String, status: String },

    #[error("flow '{0}' is obsolete and can no longer be modified")]
    FlowImmutable(String),

    #[error("flow '{0}' already exists")]
    FlowExists(String),

    #[error("flow validation failed: {0}")]
    Invalid(#[from] ValidationError),

    /// Admission refused or queue wait expired
    #[error("concurrent execution limit reached for lock '{lock_key}'")]
    ConcurrencyLimit { lock_key: String },

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("no live checkpoint for execution {0}")]
    CheckpointNotFound(String),

    #[error("execution {execution_id} cannot be {action} in status {status}")]
    InvalidState {
        execution_id: String,
        action: &'static str,
        status: String,
    },

    /// Resume payload refused by the parked node (e.g. a required screen field)
    #[error("resume rejected: {0}")]
    ResumeRejected(#[source] ActionError),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Engine-internal fault, distinct from a run ending in `failed`
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl FlowError {
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::FlowNotFound(_) => "flow_not_found",
            FlowError::FlowDisabled(_) => "flow_disabled",
            FlowError::FlowNotActive { .. } => "flow_not_active",
            FlowError::FlowImmutable(_) => "flow_immutable",
            FlowError::FlowExists(_) => "flow_exists",
            FlowError::Invalid(e) => e.code(),
            FlowError::ConcurrencyLimit { .. } => "concurrent_execution_limit",
            FlowError::ExecutionNotFound(_) => "execution_not_found",
            FlowError::CheckpointNotFound(_) => "checkpoint_not_found",
            FlowError::InvalidState { .. } => "invalid_state",
            FlowError::ResumeRejected(e) => match e.code.as_str() {
                "missing_required_field" => "missing_required_field",
                _ => "resume_rejected",
            },
            FlowError::ScheduleNotFound(_) => "schedule_not_found",
            FlowError::InvalidSchedule(_) => "invalid_schedule",
            FlowError::Storage(_) => "storage_error",
        }
    }
}

impl From<sqlx::Error> for FlowError {
    fn from(e: sqlx::Error) -> Self {
        FlowError::Storage(e.into())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Storage(e.into())
    }
}

/// Structural problems found when publishing a flow
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("flow has no start node")]
    MissingStart,

    #[error("flow has {0} start nodes, expected exactly one")]
    MultipleStarts(usize),

    #[error("start node '{0}' has incoming edges")]
    StartHasIncoming(String),

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("invalid node id '{0}'")]
    InvalidNodeId(String),

    #[error("edge references unknown node '{0}'")]
    UnknownNode(String),

    #[error("node '{0}' is not reachable from start")]
    Unreachable(String),

    #[error("parallel gateway '{gateway}' branch via '{branch}' never reaches a join gateway")]
    MissingJoin { gateway: String, branch: String },

    #[error("cycle through '{0}' does not pass through a loop node")]
    IllegalCycle(String),

    #[error("decision '{0}' has more than one default edge")]
    MultipleDefaults(String),

    #[error("boundary event '{0}' is invalid: {1}")]
    InvalidBoundary(String, String),

    #[error("end node '{0}' has outgoing edges")]
    EndHasOutgoing(String),

    #[error("flow name must not be empty")]
    EmptyName,
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingStart
            | ValidationError::MultipleStarts(_)
            | ValidationError::StartHasIncoming(_) => "invalid_start",
            ValidationError::DuplicateNode(_) | ValidationError::InvalidNodeId(_) => {
                "invalid_node_id"
            }
            ValidationError::UnknownNode(_) => "unknown_node",
            ValidationError::Unreachable(_) => "unreachable_node",
            ValidationError::MissingJoin { .. } => "missing_join",
            ValidationError::IllegalCycle(_) => "illegal_cycle",
            ValidationError::MultipleDefaults(_) => "multiple_default_edges",
            ValidationError::InvalidBoundary(..) => "invalid_boundary_event",
            ValidationError::EndHasOutgoing(_) => "end_has_outgoing",
            ValidationError::EmptyName => "empty_name",
        }
    }
}

/// Failure of a single node's underlying operation
///
/// Caught at the node boundary by the engine; never unwinds past the step loop.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{code}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct ActionError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ActionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
            stack: None,
        }
    }

    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(code, message)
        }
    }

    /// Missing or malformed node parameter
    pub fn config(message: impl Into<String>) -> Self {
        Self::new("invalid_node_config", message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

pub type FlowResult<T> = Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_share_code() {
        let err = FlowError::ConcurrencyLimit {
            lock_key: "approve_order".into(),
        };
        assert_eq!(err.code(), "concurrent_execution_limit");
    }

    #[test]
    fn validation_codes_pass_through() {
        let err: FlowError = ValidationError::Unreachable("n3".into()).into();
        assert_eq!(err.code(), "unreachable_node");
    }

    #[test]
    fn action_error_display_includes_code() {
        let err = ActionError::retryable("http_5xx", "upstream returned 503");
        assert!(err.retryable);
        assert_eq!(err.to_string(), "http_5xx: upstream returned 503");
    }
}
