/// Node actions
///
/// Every node kind is implemented by one [`NodeAction`] registered in an
/// [`ActionRegistry`] keyed by [`NodeKind`]. An action never touches run state
/// directly: it returns an [`ActionOutcome`] describing variable updates, which
/// edge to follow and whether the branch must suspend, and the engine applies it.

mod activity;
mod control;

pub use activity::{
    AssignmentAction, ConnectorAction, HttpRequestAction, RecordAction, ScriptAction,
    SubflowAction,
};
pub use control::{
    BoundaryEventAction, DecisionAction, EndAction, JoinGatewayAction, LoopAction,
    ParallelGatewayAction, ScreenAction, StartAction, WaitAction,
};

use crate::error::ActionError;
use crate::flow::{Node, NodeKind};
use crate::history::checkpoint::CheckpointReason;
use crate::runtime::context::ActionContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Which outgoing edge(s) the branch continues on
#[derive(Debug, Clone, PartialEq)]
pub enum NextEdge {
    /// First outgoing edge whose condition holds (unconditional edges always
    /// hold), else the default edge
    Follow,
    /// Every outgoing edge, each as its own concurrent branch
    All,
    /// The outgoing edge leading to this node id
    To(String),
    /// The branch ends here
    Stop,
}

/// Request to park the branch after this node
#[derive(Debug, Clone, PartialEq)]
pub struct Suspend {
    pub reason: CheckpointReason,
    /// Wake-up time for timer waits
    pub resume_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub output: Option<Value>,
    /// Variables to set once the node completes
    pub set: Map<String, Value>,
    /// Variables to remove once the node completes
    pub unset: Vec<String>,
    pub next: NextEdge,
    pub suspend: Option<Suspend>,
}

impl ActionOutcome {
    pub fn follow() -> Self {
        Self::with_next(NextEdge::Follow)
    }

    pub fn with_next(next: NextEdge) -> Self {
        Self {
            output: None,
            set: Map::new(),
            unset: Vec::new(),
            next,
            suspend: None,
        }
    }

    pub fn output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn set(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set.insert(name.into(), value);
        self
    }

    pub fn unset(mut self, name: impl Into<String>) -> Self {
        self.unset.push(name.into());
        self
    }

    pub fn suspend(mut self, reason: CheckpointReason, resume_at: Option<DateTime<Utc>>) -> Self {
        self.suspend = Some(Suspend { reason, resume_at });
        self
    }

    /// Store `value` under the node's `outputVariable` param, if it has one
    pub(crate) fn store_output(self, node_params: &Value, value: Value) -> Self {
        let target = node_params
            .get("outputVariable")
            .and_then(Value::as_str)
            .map(str::to_string);
        let outcome = self.output(value.clone());
        match target {
            Some(name) => outcome.set(name, value),
            None => outcome,
        }
    }
}

/// Behaviour of one node kind
#[async_trait]
pub trait NodeAction: Send + Sync {
    async fn execute(&self, node: &Node, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError>;

    /// Turn a resume payload into variable updates
    ///
    /// Object payloads are merged into the run variables; anything else is
    /// stored as `resumePayload`.
    fn on_resume(&self, _node: &Node, payload: &Value) -> Result<Map<String, Value>, ActionError> {
        Ok(match payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("resumePayload".into(), other.clone());
                map
            }
        })
    }
}

/// Lookup table from node kind to action
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<NodeKind, Arc<dyn NodeAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in action
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(NodeKind::Start, StartAction);
        registry.register(NodeKind::End, EndAction);
        registry.register(NodeKind::Decision, DecisionAction);
        registry.register(NodeKind::ParallelGateway, ParallelGatewayAction);
        registry.register(NodeKind::JoinGateway, JoinGatewayAction);
        registry.register(NodeKind::Wait, WaitAction);
        registry.register(NodeKind::BoundaryEvent, BoundaryEventAction);
        registry.register(NodeKind::Screen, ScreenAction);
        registry.register(NodeKind::Loop, LoopAction);
        registry.register(NodeKind::Assignment, AssignmentAction);
        registry.register(NodeKind::CreateRecord, RecordAction::Create);
        registry.register(NodeKind::UpdateRecord, RecordAction::Update);
        registry.register(NodeKind::DeleteRecord, RecordAction::Delete);
        registry.register(NodeKind::GetRecord, RecordAction::Get);
        registry.register(NodeKind::HttpRequest, HttpRequestAction);
        registry.register(NodeKind::Script, ScriptAction);
        registry.register(NodeKind::Subflow, SubflowAction);
        registry.register(NodeKind::ConnectorAction, ConnectorAction);
        registry
    }

    /// Add or replace the action for a node kind
    pub fn register(&mut self, kind: NodeKind, action: impl NodeAction + 'static) {
        self.actions.insert(kind, Arc::new(action));
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn NodeAction>> {
        self.actions.get(&kind).cloned()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.actions.keys().map(NodeKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("ActionRegistry").field("actions", &kinds).finish()
    }
}

/// Required string param
pub(crate) fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ActionError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::config(format!("missing '{key}' parameter")))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_every_kind() {
        let registry = ActionRegistry::with_builtins();
        for kind in NodeKind::ALL {
            assert!(registry.get(kind).is_some(), "no action for {kind}");
        }
    }

    #[test]
    fn default_resume_merges_objects() {
        let merged = StartAction
            .on_resume(&Node::new("n", NodeKind::Wait), &serde_json::json!({ "approved": true }))
            .unwrap();
        assert_eq!(merged["approved"], true);

        let wrapped = StartAction
            .on_resume(&Node::new("n", NodeKind::Wait), &serde_json::json!("yes"))
            .unwrap();
        assert_eq!(wrapped["resumePayload"], "yes");
    }
}
