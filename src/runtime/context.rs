/// Run and node execution context

use crate::error::FlowError;
use crate::flow::{CompiledFlow, Node};
use crate::history::log::{ExecutionLog, RunAs, Trigger, TriggerType};
use crate::runtime::collaborators::Collaborators;
use crate::runtime::expression::{resolve_references, ReferenceScope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a caller hands to `execute`: the trigger plus initial variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub trigger: Trigger,
    /// Initial run variables
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub run_as: RunAs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Nesting depth for subflow runs (0 for top-level runs)
    #[serde(default)]
    pub depth: u32,
}

impl ExecutionContext {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            params: Map::new(),
            run_as: RunAs::System,
            tenant_id: None,
            depth: 0,
        }
    }

    pub fn manual() -> Self {
        Self::new(Trigger::manual())
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn run_as(mut self, run_as: RunAs) -> Self {
        self.run_as = run_as;
        self
    }

    pub(crate) fn child(&self, inputs: Map<String, Value>) -> Self {
        Self {
            trigger: Trigger::new(TriggerType::Subflow)
                .with_metadata(serde_json::to_value(&self.trigger).unwrap_or(Value::Null)),
            params: inputs,
            run_as: self.run_as,
            tenant_id: self.tenant_id.clone(),
            depth: self.depth + 1,
        }
    }
}

/// Runs a child flow to completion on behalf of a subflow node
#[async_trait]
pub trait SubflowRunner: Send + Sync {
    async fn run_subflow(&self, flow_name: &str, context: ExecutionContext) -> Result<ExecutionLog, FlowError>;
}

/// Everything one node invocation can see
pub struct ActionContext<'a> {
    pub execution_id: &'a str,
    pub flow: &'a CompiledFlow,
    /// Snapshot of run variables taken when the node started
    pub variables: Map<String, Value>,
    pub run: &'a ExecutionContext,
    pub retry_attempt: u32,
    pub services: &'a Collaborators,
    pub subflows: &'a dyn SubflowRunner,
    pub max_subflow_depth: u32,
}

impl ActionContext<'_> {
    pub fn trigger(&self) -> &Trigger {
        &self.run.trigger
    }

    /// Node params with `$` references resolved against this run
    pub fn params(&self, node: &Node) -> Value {
        let scope = ReferenceScope {
            execution_id: self.execution_id,
            variables: &self.variables,
            trigger: &self.run.trigger,
        };
        resolve_references(&node.params, &scope)
    }
}
