/// Core flow definition types
///
/// A flow is a versioned graph of typed nodes and edges. Definitions are stored
/// as JSON and compiled into an id-indexed arena for execution, so a paused run
/// can be resumed purely from node ids without any pointer fixup.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle status of a flow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    Draft,
    Active,
    Obsolete,
    Invalid,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Draft => "draft",
            FlowStatus::Active => "active",
            FlowStatus::Obsolete => "obsolete",
            FlowStatus::Invalid => "invalid",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete flow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Unique machine identifier (e.g., "approve_order")
    pub name: String,
    /// Human-readable label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic version, bumped on every structural change
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub status: FlowStatus,
    /// Gate independent of status
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Admission policy applied to every new run of this flow
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    /// Wall-clock budget overriding the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retry default for retryable node errors, overridden per node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl FlowDefinition {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// True when the graph (nodes, edges, policy) differs from `other`
    ///
    /// Labels and descriptions are cosmetic and do not bump the version.
    pub fn structurally_differs(&self, other: &FlowDefinition) -> bool {
        let graph = |f: &FlowDefinition| {
            serde_json::to_value((&f.nodes, &f.edges, &f.concurrency, f.timeout_ms, f.max_retries))
                .unwrap_or(Value::Null)
        };
        graph(self) != graph(other)
    }
}

/// A single node in the flow graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique node identifier within the flow (e.g., "check_amount")
    pub id: String,
    /// The action which determines execution behavior
    pub action: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Action-specific parameters, opaque to the engine core
    #[serde(default)]
    pub params: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, action: NodeKind) -> Self {
        Self {
            id: id.into(),
            action,
            label: None,
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }
}

/// Available node actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    /// Takes the first outgoing edge whose condition holds, else the default edge
    Decision,
    /// Starts every outgoing edge as a concurrent branch
    ParallelGateway,
    /// Fan-in barrier over all incoming branches
    JoinGateway,
    /// Suspends until a timer, signal or approval decision
    Wait,
    /// Timer attached to an activity node via params.attachedTo
    BoundaryEvent,
    Assignment,
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
    GetRecord,
    HttpRequest,
    Script,
    /// Suspends for human input
    Screen,
    Loop,
    Subflow,
    ConnectorAction,
}

impl NodeKind {
    pub const ALL: [NodeKind; 18] = [
        NodeKind::Start,
        NodeKind::End,
        NodeKind::Decision,
        NodeKind::ParallelGateway,
        NodeKind::JoinGateway,
        NodeKind::Wait,
        NodeKind::BoundaryEvent,
        NodeKind::Assignment,
        NodeKind::CreateRecord,
        NodeKind::UpdateRecord,
        NodeKind::DeleteRecord,
        NodeKind::GetRecord,
        NodeKind::HttpRequest,
        NodeKind::Script,
        NodeKind::Screen,
        NodeKind::Loop,
        NodeKind::Subflow,
        NodeKind::ConnectorAction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Decision => "decision",
            NodeKind::ParallelGateway => "parallel_gateway",
            NodeKind::JoinGateway => "join_gateway",
            NodeKind::Wait => "wait",
            NodeKind::BoundaryEvent => "boundary_event",
            NodeKind::Assignment => "assignment",
            NodeKind::CreateRecord => "create_record",
            NodeKind::UpdateRecord => "update_record",
            NodeKind::DeleteRecord => "delete_record",
            NodeKind::GetRecord => "get_record",
            NodeKind::HttpRequest => "http_request",
            NodeKind::Script => "script",
            NodeKind::Screen => "screen",
            NodeKind::Loop => "loop",
            NodeKind::Subflow => "subflow",
            NodeKind::ConnectorAction => "connector_action",
        }
    }

    /// Activity nodes that a boundary event may preempt
    pub fn can_attach_boundary_event(&self) -> bool {
        matches!(
            self,
            NodeKind::Wait
                | NodeKind::Screen
                | NodeKind::CreateRecord
                | NodeKind::UpdateRecord
                | NodeKind::DeleteRecord
                | NodeKind::GetRecord
                | NodeKind::HttpRequest
                | NodeKind::Script
                | NodeKind::Subflow
                | NodeKind::ConnectorAction
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection between two nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    /// Lua expression evaluated against run variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    /// Followed when the source node fails instead of failing the run
    #[serde(default)]
    pub is_fault: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn default_edge(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn fault(mut self) -> Self {
        self.is_fault = true;
        self
    }
}

/// What happens when a run hits the concurrency limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Queue,
    Reject,
    CancelExisting,
}

/// Granularity at which the concurrency limit applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    #[default]
    Global,
    PerRecord,
    PerUser,
}

/// Per-flow admission configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyPolicy {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
    #[serde(default)]
    pub lock_scope: LockScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_timeout_ms: Option<u64>,
}

fn default_max_concurrent() -> u32 {
    1
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            on_conflict: ConflictPolicy::Queue,
            lock_scope: LockScope::Global,
            queue_timeout_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definition_deserializes_with_defaults() {
        let flow: FlowDefinition = serde_json::from_value(json!({
            "name": "approve_order",
            "nodes": [
                { "id": "start", "action": "start" },
                { "id": "gate", "action": "parallel_gateway" },
                { "id": "end", "action": "end" }
            ],
            "edges": [
                { "source": "start", "target": "gate" },
                { "source": "gate", "target": "end", "isDefault": true }
            ]
        }))
        .unwrap();

        assert_eq!(flow.version, 1);
        assert_eq!(flow.status, FlowStatus::Draft);
        assert!(flow.enabled);
        assert_eq!(flow.concurrency, ConcurrencyPolicy::default());
        assert_eq!(flow.nodes[1].action, NodeKind::ParallelGateway);
        assert!(flow.edges[1].is_default);
    }

    #[test]
    fn cosmetic_changes_are_not_structural() {
        let a = FlowDefinition {
            name: "f".into(),
            label: None,
            description: None,
            version: 1,
            status: FlowStatus::Draft,
            enabled: true,
            nodes: vec![Node::new("s", NodeKind::Start)],
            edges: vec![],
            concurrency: ConcurrencyPolicy::default(),
            timeout_ms: None,
            max_retries: None,
        };
        let mut b = a.clone();
        b.label = Some("Renamed".into());
        assert!(!a.structurally_differs(&b));

        b.nodes.push(Node::new("e", NodeKind::End));
        assert!(a.structurally_differs(&b));
    }

    #[test]
    fn activities_accept_boundary_events() {
        assert!(NodeKind::HttpRequest.can_attach_boundary_event());
        assert!(NodeKind::Wait.can_attach_boundary_event());
        assert!(!NodeKind::Decision.can_attach_boundary_event());
        assert!(!NodeKind::JoinGateway.can_attach_boundary_event());
    }
}
