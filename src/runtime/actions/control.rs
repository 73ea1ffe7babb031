/// Control-flow actions: gateways, waits, screens and loops

use super::{required_str, ActionOutcome, NextEdge, NodeAction};
use crate::error::ActionError;
use crate::flow::Node;
use crate::history::checkpoint::CheckpointReason;
use crate::runtime::context::ActionContext;
use crate::runtime::expression::evaluate_condition;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

pub struct StartAction;

#[async_trait]
impl NodeAction for StartAction {
    async fn execute(&self, _node: &Node, _ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::follow())
    }
}

pub struct EndAction;

#[async_trait]
impl NodeAction for EndAction {
    async fn execute(&self, _node: &Node, _ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::with_next(NextEdge::Stop))
    }
}

/// First true condition in declaration order, else the default edge
pub struct DecisionAction;

#[async_trait]
impl NodeAction for DecisionAction {
    async fn execute(&self, node: &Node, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let edges = ctx.flow.outgoing(&node.id);

        for edge in edges.iter().filter(|e| !e.is_default) {
            let taken = match &edge.condition {
                Some(condition) => evaluate_condition(condition, &ctx.variables)?,
                None => true,
            };
            if taken {
                return Ok(ActionOutcome::with_next(NextEdge::To(edge.target.clone()))
                    .output(json!({ "edge": edge.target })));
            }
        }

        match edges.iter().find(|e| e.is_default) {
            Some(edge) => Ok(ActionOutcome::with_next(NextEdge::To(edge.target.clone()))
                .output(json!({ "edge": edge.target, "default": true }))),
            None => Err(ActionError::new(
                "no_matching_edge",
                format!("no condition of decision '{}' matched and it has no default edge", node.id),
            )),
        }
    }
}

pub struct ParallelGatewayAction;

#[async_trait]
impl NodeAction for ParallelGatewayAction {
    async fn execute(&self, node: &Node, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let branches: Vec<_> = ctx.flow.outgoing(&node.id).iter().map(|e| e.target.clone()).collect();
        Ok(ActionOutcome::with_next(NextEdge::All).output(json!({ "branches": branches })))
    }
}

/// The barrier itself lives in the engine; the join node runs once all
/// branches have arrived.
pub struct JoinGatewayAction;

#[async_trait]
impl NodeAction for JoinGatewayAction {
    async fn execute(&self, _node: &Node, _ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::follow())
    }
}

/// Timer, signal or approval wait
///
/// Params: `durationMs` for a timer, `reason: "approval"` for an approval
/// decision, anything else waits for an external signal.
pub struct WaitAction;

#[async_trait]
impl NodeAction for WaitAction {
    async fn execute(&self, node: &Node, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let params = ctx.params(node);

        if let Some(duration_ms) = params.get("durationMs").and_then(Value::as_u64) {
            let resume_at = Utc::now() + chrono::Duration::milliseconds(duration_ms as i64);
            return Ok(ActionOutcome::follow()
                .output(json!({ "waitingFor": "timer", "resumeAt": resume_at }))
                .suspend(CheckpointReason::Wait, Some(resume_at)));
        }

        let (reason, waiting_for) = match params.get("reason").and_then(Value::as_str) {
            Some("approval") => (CheckpointReason::Approval, "approval"),
            _ => (CheckpointReason::Wait, "signal"),
        };
        Ok(ActionOutcome::follow()
            .output(json!({ "waitingFor": waiting_for }))
            .suspend(reason, None))
    }
}

/// Walked only after its timer fired on the host
pub struct BoundaryEventAction;

#[async_trait]
impl NodeAction for BoundaryEventAction {
    async fn execute(&self, node: &Node, _ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::follow().output(json!({
            "firedFor": node.param_str("attachedTo"),
            "timerMs": node.param_u64("timerMs"),
        })))
    }
}

/// Human input form; suspends until the form is submitted
pub struct ScreenAction;

#[async_trait]
impl NodeAction for ScreenAction {
    async fn execute(&self, node: &Node, _ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let fields = node.params.get("fields").cloned().unwrap_or(Value::Array(vec![]));
        Ok(ActionOutcome::follow()
            .output(json!({ "fields": fields }))
            .suspend(CheckpointReason::ScreenInput, None))
    }

    fn on_resume(&self, node: &Node, payload: &Value) -> Result<Map<String, Value>, ActionError> {
        let submitted = payload.as_object().cloned().unwrap_or_default();
        let fields = node.params.get("fields").and_then(Value::as_array);

        for field in fields.into_iter().flatten() {
            let Some(name) = field.get("name").and_then(Value::as_str) else {
                continue;
            };
            let required = field.get("required").and_then(Value::as_bool).unwrap_or(false);
            let present = submitted.get(name).is_some_and(|v| !v.is_null());
            if required && !present {
                return Err(ActionError::new(
                    "missing_required_field",
                    format!("screen '{}' requires field '{}'", node.id, name),
                ));
            }
        }

        Ok(submitted)
    }
}

/// Iterates `collection`, one body pass per element
///
/// The non-default outgoing edge leads into the body; the default edge exits.
/// Progress is kept in the `__loop.<node id>` variable so it survives
/// suspensions inside the body.
pub struct LoopAction;

#[async_trait]
impl NodeAction for LoopAction {
    async fn execute(&self, node: &Node, ctx: &ActionContext<'_>) -> Result<ActionOutcome, ActionError> {
        let params = ctx.params(node);
        let items = match params.get("collection") {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(ActionError::config(format!(
                    "loop '{}' collection must be an array, got {}",
                    node.id, other
                )))
            }
        };
        let item_variable = params.get("itemVariable").and_then(Value::as_str).unwrap_or("item");
        let index_variable = params.get("indexVariable").and_then(Value::as_str).unwrap_or("index");

        let counter = format!("__loop.{}", node.id);
        let index = ctx.variables.get(&counter).and_then(Value::as_u64).unwrap_or(0) as usize;

        let edges = ctx.flow.outgoing(&node.id);
        let body = edges.iter().find(|e| !e.is_default);
        let exit = edges.iter().find(|e| e.is_default);

        match (items.get(index), body) {
            (Some(item), Some(body)) => Ok(ActionOutcome::with_next(NextEdge::To(body.target.clone()))
                .set(item_variable, item.clone())
                .set(index_variable, json!(index))
                .set(counter, json!(index + 1))
                .output(json!({ "index": index, "total": items.len() }))),
            _ => {
                let outcome = ActionOutcome::with_next(match exit {
                    Some(exit) => NextEdge::To(exit.target.clone()),
                    None => NextEdge::Stop,
                });
                Ok(outcome
                    .unset(counter)
                    .output(json!({ "completed": true, "iterations": index })))
            }
        }
    }
}
