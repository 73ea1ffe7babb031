/// Activity actions backed by collaborators

use super::{required_str, ActionOutcome, NodeAction};
use crate::error::{ActionError, FlowError};
use crate::flow::Node;
use crate::history::log::ExecutionStatus;
use crate::runtime::collaborators::HttpRequest;
use crate::runtime::context::ActionContext;
use crate::runtime::expression::evaluate;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Sets variables from literal values or Lua expressions
///
/// Params: `assignments: [{ variable, value? , expression? }]`, applied in
/// order so later expressions see earlier assignments.
pub struct AssignmentAction;

#[async_trait]
impl NodeAction for AssignmentAction {
    async fn execute(&self, node: &Node, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let params = ctx.params(node);
        let assignments = params
            .get("assignments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut scope = ctx.variables.clone();
        let mut outcome = ActionOutcome::follow();
        for assignment in &assignments {
            let variable = required_str(assignment, "variable")?;
            let value = match assignment.get("expression").and_then(Value::as_str) {
                Some(expr) => evaluate(expr, &scope)?,
                None => assignment.get("value").cloned().unwrap_or(Value::Null),
            };
            scope.insert(variable.to_string(), value.clone());
            outcome = outcome.set(variable, value);
        }

        let assigned = Value::Object(outcome.set.clone());
        Ok(outcome.output(assigned))
    }
}

/// CRUD against the record store
pub enum RecordAction {
    Create,
    Update,
    Delete,
    Get,
}

#[async_trait]
impl NodeAction for RecordAction {
    async fn execute(&self, node: &Node, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let params = ctx.params(node);
        let object = required_str(&params, "object")?;
        let records = &ctx.services.records;
        let data = params.get("data").cloned().unwrap_or_else(|| json!({}));

        let result = match self {
            RecordAction::Create => records.create(object, data).await?,
            RecordAction::Update => {
                let id = required_str(&params, "recordId")?;
                records.update(object, id, data).await?
            }
            RecordAction::Delete => {
                let id = required_str(&params, "recordId")?;
                json!({ "deleted": records.delete(object, id).await? })
            }
            RecordAction::Get => {
                let id = required_str(&params, "recordId")?;
                records.get(object, id).await?.unwrap_or(Value::Null)
            }
        };

        Ok(ActionOutcome::follow().store_output(&params, result))
    }
}

/// Outbound HTTP call
///
/// Transport errors and 5xx responses are retryable; 4xx responses are not.
pub struct HttpRequestAction;

#[async_trait]
impl NodeAction for HttpRequestAction {
    async fn execute(&self, node: &Node, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let params = ctx.params(node);
        let headers: HashMap<String, String> = params
            .get("headers")
            .and_then(Value::as_object)
            .map(|h| {
                h.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let request = HttpRequest {
            method: params.get("method").and_then(Value::as_str).unwrap_or("GET").to_string(),
            url: required_str(&params, "url")?.to_string(),
            headers,
            body: params.get("body").filter(|b| !b.is_null()).cloned(),
            timeout_ms: params.get("timeoutMs").and_then(Value::as_u64),
        };

        tracing::debug!(node_id = %node.id, method = %request.method, url = %request.url, "Sending HTTP request");
        let response = ctx.services.http.send(request).await?;

        match response.status {
            500..=599 => Err(ActionError::retryable(
                "http_5xx",
                format!("upstream returned {}", response.status),
            )),
            400..=499 => Err(ActionError::new(
                "http_4xx",
                format!("request rejected with {}", response.status),
            )),
            _ => {
                let value = json!({
                    "status": response.status,
                    "headers": response.headers,
                    "body": response.body,
                });
                Ok(ActionOutcome::follow().store_output(&params, value))
            }
        }
    }
}

pub struct ScriptAction;

#[async_trait]
impl NodeAction for ScriptAction {
    async fn execute(&self, node: &Node, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let source = required_str(&node.params, "source")?;
        let outcome = ctx.services.scripts.run(source, &ctx.variables).await;

        match outcome.error {
            Some(message) => Err(ActionError::new("script_error", message)),
            None => Ok(ActionOutcome::follow().store_output(&node.params, outcome.output)),
        }
    }
}

/// Runs another flow to completion and returns its variables
pub struct SubflowAction;

#[async_trait]
impl NodeAction for SubflowAction {
    async fn execute(&self, node: &Node, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let params = ctx.params(node);
        let flow_name = required_str(&params, "flowName")?;
        if ctx.run.depth + 1 > ctx.max_subflow_depth {
            return Err(ActionError::new(
                "subflow_depth_exceeded",
                format!("subflow nesting deeper than {}", ctx.max_subflow_depth),
            ));
        }

        let inputs: Map<String, Value> = params
            .get("inputs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let child = ctx
            .subflows
            .run_subflow(flow_name, ctx.run.child(inputs))
            .await
            .map_err(|e| match e {
                FlowError::ConcurrencyLimit { .. } => ActionError::retryable(e.code(), e.to_string()),
                other => ActionError::new("subflow_rejected", other.to_string()),
            })?;

        match child.status {
            ExecutionStatus::Completed => {
                let result = Value::Object(child.variables);
                Ok(ActionOutcome::follow()
                    .store_output(&params, result)
                    .output(json!({ "executionId": child.id, "status": "completed" })))
            }
            ExecutionStatus::Paused => Err(ActionError::new(
                "subflow_paused",
                format!("subflow '{}' run {} suspended instead of completing", flow_name, child.id),
            )),
            status => Err(ActionError::new(
                "subflow_failed",
                format!("subflow '{}' run {} ended {}", flow_name, child.id, status),
            )),
        }
    }
}

/// Invokes a named connector operation
pub struct ConnectorAction;

#[async_trait]
impl NodeAction for ConnectorAction {
    async fn execute(&self, node: &Node, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let params = ctx.params(node);
        let name = required_str(&params, "connector")?;
        let operation = required_str(&params, "operation")?;
        let connector = ctx
            .services
            .connectors
            .get(name)
            .ok_or_else(|| ActionError::config(format!("unknown connector '{name}'")))?;

        let input = params.get("input").cloned().unwrap_or(Value::Null);
        let result = connector.invoke(operation, input).await?;
        Ok(ActionOutcome::follow().store_output(&params, result))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::run;
    use super::*;
    use crate::flow::{CompiledFlow, ConcurrencyPolicy, FlowDefinition, FlowStatus, NodeKind};
    use crate::runtime::collaborators::{Collaborators, HttpResponse, HttpTransport};
    use std::sync::Arc;

    fn single(node: Node) -> CompiledFlow {
        CompiledFlow::compile(FlowDefinition {
            name: "activity".into(),
            label: None,
            description: None,
            version: 1,
            status: FlowStatus::Active,
            enabled: true,
            nodes: vec![node],
            edges: vec![],
            concurrency: ConcurrencyPolicy::default(),
            timeout_ms: None,
            max_retries: None,
        })
    }

    struct FixedStatus(u16);

    #[async_trait]
    impl HttpTransport for FixedStatus {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, ActionError> {
            Ok(HttpResponse {
                status: self.0,
                headers: HashMap::new(),
                body: json!({ "ok": self.0 < 400 }),
            })
        }
    }

    #[tokio::test]
    async fn assignments_see_earlier_values() {
        let flow = single(Node::new("set", NodeKind::Assignment).with_params(json!({
            "assignments": [
                { "variable": "total", "expression": "amount * 2" },
                { "variable": "vip", "expression": "total > 100" },
                { "variable": "source", "value": "$trigger.type" }
            ]
        })));
        let out = run(&AssignmentAction, &flow, "set", json!({ "amount": 60 }), &Collaborators::default())
            .await
            .unwrap();
        assert_eq!(out.set["total"], 120);
        assert_eq!(out.set["vip"], true);
        assert_eq!(out.set["source"], "manual");
    }

    #[tokio::test]
    async fn http_status_classes_map_to_retryability() {
        let flow = single(Node::new("call", NodeKind::HttpRequest).with_params(json!({
            "url": "https://example.test/orders",
            "outputVariable": "response"
        })));

        for (status, retryable) in [(503u16, Some(true)), (404, Some(false)), (200, None)] {
            let services = Collaborators::default().with_http(Arc::new(FixedStatus(status)));
            let result = run(&HttpRequestAction, &flow, "call", json!({}), &services).await;
            match retryable {
                Some(expected) => assert_eq!(result.unwrap_err().retryable, expected),
                None => assert_eq!(result.unwrap().set["response"]["status"], 200),
            }
        }
    }

    #[tokio::test]
    async fn record_nodes_use_record_store() {
        let services = Collaborators::default();
        let create = single(Node::new("create", NodeKind::CreateRecord).with_params(json!({
            "object": "ticket",
            "data": { "id": "t-1", "title": "$var.title" },
            "outputVariable": "ticket"
        })));
        let out = run(&RecordAction::Create, &create, "create", json!({ "title": "Broken" }), &services)
            .await
            .unwrap();
        assert_eq!(out.set["ticket"]["title"], "Broken");

        let get = single(Node::new("get", NodeKind::GetRecord).with_params(json!({
            "object": "ticket",
            "recordId": "t-1"
        })));
        let found = run(&RecordAction::Get, &get, "get", json!({}), &services).await.unwrap();
        assert_eq!(found.output.unwrap()["id"], "t-1");
    }

    #[tokio::test]
    async fn unknown_connector_is_config_error() {
        let flow = single(Node::new("push", NodeKind::ConnectorAction).with_params(json!({
            "connector": "slack",
            "operation": "post"
        })));
        let err = run(&ConnectorAction, &flow, "push", json!({}), &Collaborators::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_node_config");
    }
}
