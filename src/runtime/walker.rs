/// Graph walker for one run segment
///
/// A segment starts from one or more cursors (the start node for a fresh run,
/// parked branches for a resume) and walks until every branch has ended,
/// parked, or the run failed. Parallel branches are polled concurrently and
/// share one `RunState` behind a mutex. The guard is never held across an
/// action call.

use crate::error::ActionError;
use crate::flow::{CompiledFlow, Node, NodeKind};
use crate::history::checkpoint::{Checkpoint, CheckpointReason, ParkedNode, ResumeMode};
use crate::history::error_log::{ExecutionError, Severity};
use crate::history::log::{ExecutionStatus, ExecutionStepLog, StepError, StepStatus};
use crate::runtime::actions::{ActionOutcome, NextEdge};
use crate::runtime::context::{ActionContext, ExecutionContext};
use crate::runtime::engine::Engine;
use crate::runtime::expression::evaluate_condition;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Visit key for the n-th visit of a node (1-based)
pub(crate) fn visit_key(node_id: &str, visit: u32) -> String {
    if visit <= 1 {
        node_id.to_string()
    } else {
        format!("{node_id}#{visit}")
    }
}

/// Mutable working memory of a run, shared by its branches
#[derive(Debug, Default)]
pub(crate) struct RunState {
    pub variables: Map<String, Value>,
    completed: Vec<String>,
    completed_set: HashSet<String>,
    visits: HashMap<String, u32>,
    join_arrivals: HashMap<String, u32>,
    pub parked: Vec<ParkedNode>,
    pub failure: Option<ExecutionStatus>,
}

impl RunState {
    pub fn new(variables: Map<String, Value>) -> Self {
        Self {
            variables,
            ..Default::default()
        }
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            variables: checkpoint.variables.clone(),
            completed_set: checkpoint.completed_node_ids.iter().cloned().collect(),
            completed: checkpoint.completed_node_ids.clone(),
            visits: checkpoint.visits.clone(),
            join_arrivals: checkpoint.join_arrivals.clone(),
            parked: checkpoint.parked.clone(),
            failure: None,
        }
    }

    /// Remove a parked entry so it can continue
    pub fn take_parked(&mut self, visit_key: &str) -> Option<ParkedNode> {
        let pos = self.parked.iter().position(|p| p.visit_key == visit_key)?;
        Some(self.parked.remove(pos))
    }

    fn complete(&mut self, key: &str) {
        if self.completed_set.insert(key.to_string()) {
            self.completed.push(key.to_string());
        }
    }

    fn apply(&mut self, outcome: &ActionOutcome) {
        for (name, value) in &outcome.set {
            self.variables.insert(name.clone(), value.clone());
        }
        for name in &outcome.unset {
            self.variables.remove(name);
        }
    }

    /// First join still waiting on siblings
    fn partial_join(&self) -> Option<&str> {
        self.join_arrivals
            .iter()
            .filter(|(_, arrived)| **arrived > 0)
            .map(|(id, _)| id.as_str())
            .min()
    }
}

/// Where a branch continues
#[derive(Debug, Clone)]
pub(crate) enum Cursor {
    /// Visit this node; a given visit key re-runs that exact visit
    Run { node_id: String, visit_key: Option<String> },
    /// The node finished; pick its outgoing edge(s)
    After { node_id: String, next: NextEdge },
}

impl Cursor {
    pub fn run(node_id: impl Into<String>) -> Self {
        Cursor::Run {
            node_id: node_id.into(),
            visit_key: None,
        }
    }
}

enum NodeResult {
    Done {
        outcome: ActionOutcome,
        started_at: DateTime<Utc>,
        input: Value,
        attempt: u32,
    },
    /// A boundary timer preempted the host
    Preempted { boundary_id: String },
    Failed { error: ActionError },
    /// Cancelled after a failed attempt or while backing off
    Interrupted,
}

/// How a segment ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentEnd {
    Finished(ExecutionStatus),
    Suspended,
}

pub(crate) struct Walk {
    pub engine: Engine,
    pub flow: Arc<CompiledFlow>,
    pub execution_id: String,
    pub lock_key: String,
    pub started_at: DateTime<Utc>,
    pub run: ExecutionContext,
    pub state: Mutex<RunState>,
    pub token: CancellationToken,
}

impl Walk {
    /// Walk all cursors to the end of the segment, then persist the outcome
    pub async fn drive(self, cursors: Vec<Cursor>) -> Result<SegmentEnd> {
        let branches = join_all(cursors.into_iter().map(|c| self.walk_branch(c)));

        let budget = self
            .flow
            .definition
            .timeout_ms
            .or(self.engine.config().execution_budget_ms)
            .map(|ms| {
                let elapsed = (Utc::now() - self.started_at).num_milliseconds().max(0) as u64;
                Duration::from_millis(ms.saturating_sub(elapsed))
            });

        let results = match budget {
            Some(remaining) => match tokio::time::timeout(remaining, branches).await {
                Ok(results) => results,
                Err(_) => {
                    self.fail_with(ExecutionStatus::TimedOut, None, "execution_timeout", "execution budget elapsed")
                        .await?;
                    Vec::new()
                }
            },
            None => branches.await,
        };
        for result in results {
            result?;
        }

        self.finish().await
    }

    async fn finish(self) -> Result<SegmentEnd> {
        let engine = self.engine.clone();
        let state = self.state.into_inner();
        let id = self.execution_id.as_str();

        if let Some(status) = state.failure {
            let ended = engine.end_run(id, status, None, Some(&state.variables)).await?;
            if ended {
                engine.concurrency().release(&self.lock_key, id).await;
            }
            tracing::info!(execution_id = id, flow = self.flow.name(), status = %status, "Execution ended");
            return Ok(SegmentEnd::Finished(status));
        }

        let waiting_on = match (state.partial_join(), state.parked.first()) {
            (Some(join), _) => Some((CheckpointReason::ParallelJoin, join.to_string())),
            (None, Some(parked)) => Some((parked.reason, parked.node_id.clone())),
            (None, None) => None,
        };
        if let Some((reason, current)) = waiting_on {
            let now = Utc::now();
            let checkpoint = Checkpoint {
                id: uuid::Uuid::new_v4().to_string(),
                execution_id: id.to_string(),
                flow_name: self.flow.name().to_string(),
                flow_version: self.flow.version(),
                current_node_id: current,
                resume_at: state.parked.iter().filter_map(ParkedNode::wake_at).min(),
                variables: state.variables,
                completed_node_ids: state.completed,
                created_at: now,
                expires_at: engine
                    .config()
                    .checkpoint_ttl_ms
                    .map(|ms| now + chrono::Duration::milliseconds(ms as i64)),
                reason,
                parked: state.parked,
                join_arrivals: state.join_arrivals,
                visits: state.visits,
                consumed_at: None,
            };
            if engine.checkpoints().suspend(&checkpoint).await? {
                return Ok(SegmentEnd::Suspended);
            }
            tracing::warn!(execution_id = id, "Run ended elsewhere while suspending; checkpoint dropped");
            return Ok(SegmentEnd::Finished(ExecutionStatus::Cancelled));
        }

        let ended = engine.end_run(id, ExecutionStatus::Completed, None, Some(&state.variables)).await?;
        if ended {
            engine.concurrency().release(&self.lock_key, id).await;
        }
        tracing::info!(execution_id = id, flow = self.flow.name(), "Execution completed");
        Ok(SegmentEnd::Finished(ExecutionStatus::Completed))
    }

    /// Log the step of a parked node that is now resuming and continue after it
    pub async fn resume_after(&self, parked: &ParkedNode, output: Value) -> Result<Cursor> {
        if let Some(node) = self.flow.node(&parked.node_id) {
            self.log_step(node, StepStatus::Success, parked.started_at, None, Some(output), None, 0)
                .await?;
        }
        self.state.lock().await.complete(&parked.visit_key);
        Ok(Cursor::After {
            node_id: parked.node_id.clone(),
            next: NextEdge::Follow,
        })
    }

    /// Abort a parked host in favour of its boundary event
    pub async fn fire_boundary(&self, parked: &ParkedNode, boundary_id: &str) -> Result<Cursor> {
        if let Some(node) = self.flow.node(&parked.node_id) {
            let error = ActionError::new("boundary_event_fired", format!("boundary '{boundary_id}' fired"));
            self.log_step(node, StepStatus::Skipped, parked.started_at, None, None, Some(&error), 0)
                .await?;
        }
        self.state.lock().await.complete(&parked.visit_key);
        tracing::info!(
            execution_id = %self.execution_id,
            node_id = %parked.node_id,
            boundary = boundary_id,
            "Boundary event fired on parked node"
        );
        Ok(Cursor::run(boundary_id))
    }

    fn walk_branch(&self, cursor: Cursor) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut cursor = cursor;
            loop {
                cursor = match cursor {
                    Cursor::After { node_id, next } => {
                        let targets = match self.next_targets(&node_id, &next).await {
                            Ok(targets) => targets,
                            Err(error) => {
                                self.fail_with(ExecutionStatus::Failed, Some(&node_id), &error.code, &error.message)
                                    .await?;
                                return Ok(());
                            }
                        };
                        match targets.as_slice() {
                            [] => return Ok(()),
                            [only] => Cursor::run(only.clone()),
                            _ => {
                                let branches = targets.into_iter().map(|t| self.walk_branch(Cursor::run(t)));
                                for result in join_all(branches).await {
                                    result?;
                                }
                                return Ok(());
                            }
                        }
                    }
                    Cursor::Run { node_id, visit_key } => match self.visit(&node_id, visit_key).await? {
                        Some(next) => next,
                        None => return Ok(()),
                    },
                };
            }
        })
    }

    async fn next_targets(&self, node_id: &str, next: &NextEdge) -> Result<Vec<String>, ActionError> {
        match next {
            NextEdge::Stop => Ok(Vec::new()),
            NextEdge::To(target) => Ok(vec![target.clone()]),
            NextEdge::All => Ok(self.flow.outgoing(node_id).iter().map(|e| e.target.clone()).collect()),
            NextEdge::Follow => {
                let edges = self.flow.outgoing(node_id);
                if edges.is_empty() {
                    return Ok(Vec::new());
                }
                let variables = self.state.lock().await.variables.clone();
                for edge in edges.iter().filter(|e| !e.is_default) {
                    let taken = match &edge.condition {
                        Some(condition) => evaluate_condition(condition, &variables)?,
                        None => true,
                    };
                    if taken {
                        return Ok(vec![edge.target.clone()]);
                    }
                }
                match edges.iter().find(|e| e.is_default) {
                    Some(edge) => Ok(vec![edge.target.clone()]),
                    None => Err(ActionError::new(
                        "no_matching_edge",
                        format!("no outgoing edge of '{node_id}' matched"),
                    )),
                }
            }
        }
    }

    /// Visit one node; returns where the branch continues, if anywhere
    async fn visit(&self, node_id: &str, revisit: Option<String>) -> Result<Option<Cursor>> {
        if self.state.lock().await.failure.is_some() {
            return Ok(None);
        }
        if self.token.is_cancelled() {
            self.set_failure(ExecutionStatus::Cancelled).await;
            return Ok(None);
        }
        let Some(node) = self.flow.node(node_id) else {
            self.fail_with(
                ExecutionStatus::Failed,
                Some(node_id),
                "unknown_node",
                &format!("edge leads to unknown node '{node_id}'"),
            )
            .await?;
            return Ok(None);
        };

        let fresh = revisit.is_none();
        let key = {
            let mut state = self.state.lock().await;

            // Fan-in barrier: only the last arriving branch runs the join
            if fresh && node.action == NodeKind::JoinGateway {
                let expected = self.flow.incoming_count(node_id).max(1) as u32;
                let arrived = state.join_arrivals.entry(node_id.to_string()).or_insert(0);
                *arrived += 1;
                if *arrived < expected {
                    return Ok(None);
                }
                state.join_arrivals.remove(node_id);
            }

            match revisit {
                Some(key) => key,
                None => {
                    let visits = state.visits.entry(node_id.to_string()).or_insert(0);
                    *visits += 1;
                    let visit = *visits;
                    if visit > self.engine.config().max_node_visits {
                        drop(state);
                        self.fail_with(
                            ExecutionStatus::Failed,
                            Some(node_id),
                            "loop_limit_exceeded",
                            &format!("node '{node_id}' visited more than {} times", visit - 1),
                        )
                        .await?;
                        return Ok(None);
                    }
                    visit_key(node_id, visit)
                }
            }
        };

        if self.state.lock().await.completed_set.contains(&key) {
            tracing::debug!(execution_id = %self.execution_id, node_id, key = %key, "Skipping completed visit");
            return Ok(Some(Cursor::After {
                node_id: node_id.to_string(),
                next: NextEdge::Follow,
            }));
        }

        if self.engine.pause_requested(&self.execution_id) {
            self.park(node, key, CheckpointReason::ManualPause, ResumeMode::AtNode, Utc::now(), None)
                .await;
            return Ok(None);
        }

        match self.run_node(node, &key).await? {
            NodeResult::Done {
                outcome,
                started_at,
                input,
                attempt,
            } => {
                self.state.lock().await.apply(&outcome);

                if outcome.suspend.is_some() && self.token.is_cancelled() {
                    self.set_failure(ExecutionStatus::Cancelled).await;
                    return Ok(None);
                }
                if let Some(suspend) = &outcome.suspend {
                    self.park(node, key, suspend.reason, ResumeMode::AfterNode, started_at, suspend.resume_at)
                        .await;
                    return Ok(None);
                }

                self.log_step(node, StepStatus::Success, started_at, Some(input), outcome.output.clone(), None, attempt)
                    .await?;
                self.state.lock().await.complete(&key);

                if self.token.is_cancelled() {
                    self.set_failure(ExecutionStatus::Cancelled).await;
                    return Ok(None);
                }
                Ok(match outcome.next {
                    NextEdge::Stop => None,
                    next => Some(Cursor::After {
                        node_id: node_id.to_string(),
                        next,
                    }),
                })
            }
            NodeResult::Preempted { boundary_id } => Ok(Some(Cursor::run(boundary_id))),
            NodeResult::Failed { error } => self.handle_failure(node, key, error).await,
            NodeResult::Interrupted => Ok(None),
        }
    }

    /// Run a node with retries, racing it against its boundary timer
    async fn run_node(&self, node: &Node, key: &str) -> Result<NodeResult> {
        let Some(action) = self.engine.actions().get(node.action) else {
            return Ok(NodeResult::Failed {
                error: ActionError::new("unknown_action", format!("no action registered for '{}'", node.action)),
            });
        };

        let max_retries = node
            .param_u64("maxRetries")
            .map(|n| n as u32)
            .or(self.flow.definition.max_retries)
            .unwrap_or_else(|| self.engine.config().max_retries_for(node.action.as_str()));

        let boundary = self
            .flow
            .boundaries_for(&node.id)
            .into_iter()
            .filter_map(|b| b.param_u64("timerMs").map(|ms| (b.id.clone(), ms)))
            .min_by_key(|(_, ms)| *ms)
            .map(|(id, ms)| (id, tokio::time::Instant::now() + Duration::from_millis(ms)));

        let mut attempt = 0u32;
        loop {
            let started_at = Utc::now();
            let variables = self.state.lock().await.variables.clone();
            let ctx = ActionContext {
                execution_id: &self.execution_id,
                flow: &self.flow,
                variables,
                run: &self.run,
                retry_attempt: attempt,
                services: self.engine.services(),
                subflows: &self.engine,
                max_subflow_depth: self.engine.config().max_subflow_depth,
            };
            let input = ctx.params(node);

            let boundary_timer = async {
                match &boundary {
                    Some((_, deadline)) => tokio::time::sleep_until(*deadline).await,
                    None => std::future::pending().await,
                }
            };
            // Cancellation is cooperative: an in-flight call finishes first
            let result = tokio::select! {
                result = action.execute(node, &ctx) => Some(result),
                _ = boundary_timer => None,
            };

            match result {
                None => {
                    let boundary_id = boundary.as_ref().map(|(id, _)| id.clone()).unwrap_or_default();
                    let error = ActionError::new("boundary_event_fired", format!("boundary '{boundary_id}' fired"));
                    self.log_step(node, StepStatus::Skipped, started_at, Some(input), None, Some(&error), attempt)
                        .await?;
                    self.state.lock().await.complete(key);
                    tracing::info!(
                        execution_id = %self.execution_id,
                        node_id = %node.id,
                        boundary = %boundary_id,
                        "Boundary event preempted node"
                    );
                    return Ok(NodeResult::Preempted { boundary_id });
                }
                Some(Ok(outcome)) => {
                    if attempt > 0 {
                        self.engine.errors().resolve_node(&self.execution_id, &node.id).await?;
                    }
                    return Ok(NodeResult::Done {
                        outcome,
                        started_at,
                        input,
                        attempt,
                    });
                }
                Some(Err(error)) => {
                    self.log_step(node, StepStatus::Failure, started_at, Some(input), None, Some(&error), attempt)
                        .await?;

                    if self.token.is_cancelled() {
                        self.set_failure(ExecutionStatus::Cancelled).await;
                        return Ok(NodeResult::Interrupted);
                    }
                    if !(error.retryable && attempt < max_retries) {
                        return Ok(NodeResult::Failed { error });
                    }

                    let record = ExecutionError::new(&self.execution_id, Severity::Error, &error.code, &error.message)
                        .at_node(&node.id)
                        .retryable(true)
                        .with_stack(error.stack.clone())
                        .with_context(json!({ "retryAttempt": attempt, "maxRetries": max_retries }));
                    self.engine.errors().record(&record).await?;

                    let logs = self.engine.logs();
                    if !logs.set_status(&self.execution_id, ExecutionStatus::Retrying).await? {
                        // Ended elsewhere; nothing left to retry for
                        self.set_failure(ExecutionStatus::Cancelled).await;
                        return Ok(NodeResult::Interrupted);
                    }
                    let backoff = Duration::from_millis(self.engine.config().retry_backoff_ms);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.token.cancelled() => {
                            self.set_failure(ExecutionStatus::Cancelled).await;
                            return Ok(NodeResult::Interrupted);
                        }
                    }
                    logs.set_status(&self.execution_id, ExecutionStatus::Running).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn handle_failure(&self, node: &Node, key: String, error: ActionError) -> Result<Option<Cursor>> {
        if let Some(edge) = self.flow.fault_edge(&node.id) {
            let record = ExecutionError::new(&self.execution_id, Severity::Error, &error.code, &error.message)
                .at_node(&node.id)
                .retryable(error.retryable)
                .with_stack(error.stack.clone());
            self.engine.errors().record(&record).await?;

            let mut state = self.state.lock().await;
            state.variables.insert(
                "lastError".into(),
                json!({ "nodeId": node.id, "code": error.code, "message": error.message }),
            );
            state.complete(&key);
            return Ok(Some(Cursor::run(edge.target.clone())));
        }

        if node.param_str("onError") == Some("pause") {
            let record = ExecutionError::new(&self.execution_id, Severity::Error, &error.code, &error.message)
                .at_node(&node.id)
                .retryable(error.retryable)
                .with_stack(error.stack.clone());
            self.engine.errors().record(&record).await?;
            self.park(node, key, CheckpointReason::Error, ResumeMode::AtNode, Utc::now(), None)
                .await;
            return Ok(None);
        }

        let record = ExecutionError::new(&self.execution_id, Severity::Critical, &error.code, &error.message)
            .at_node(&node.id)
            .retryable(error.retryable)
            .with_stack(error.stack.clone());
        self.engine.errors().record(&record).await?;
        self.set_failure(ExecutionStatus::Failed).await;
        Ok(None)
    }

    async fn park(
        &self,
        node: &Node,
        key: String,
        reason: CheckpointReason,
        mode: ResumeMode,
        started_at: DateTime<Utc>,
        resume_at: Option<DateTime<Utc>>,
    ) {
        // Waiting hosts keep their boundary timer armed while parked
        let boundary = match mode {
            ResumeMode::AfterNode => self
                .flow
                .boundaries_for(&node.id)
                .into_iter()
                .filter_map(|b| b.param_u64("timerMs").map(|ms| (b.id.clone(), ms)))
                .min_by_key(|(_, ms)| *ms)
                .map(|(id, ms)| (id, started_at + chrono::Duration::milliseconds(ms as i64))),
            ResumeMode::AtNode => None,
        };

        tracing::info!(
            execution_id = %self.execution_id,
            node_id = %node.id,
            reason = %reason,
            "Branch parked"
        );
        self.state.lock().await.parked.push(ParkedNode {
            node_id: node.id.clone(),
            visit_key: key,
            reason,
            mode,
            started_at,
            resume_at,
            boundary_node_id: boundary.as_ref().map(|(id, _)| id.clone()),
            boundary_at: boundary.map(|(_, at)| at),
        });
    }

    async fn set_failure(&self, status: ExecutionStatus) {
        self.state.lock().await.failure.get_or_insert(status);
    }

    /// End the run with a critical, flow-level error
    async fn fail_with(&self, status: ExecutionStatus, node_id: Option<&str>, code: &str, message: &str) -> Result<()> {
        let mut record = ExecutionError::new(&self.execution_id, Severity::Critical, code, message);
        if let Some(node_id) = node_id {
            record = record.at_node(node_id);
        }
        self.engine.errors().record(&record).await?;
        self.set_failure(status).await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_step(
        &self,
        node: &Node,
        status: StepStatus,
        started_at: DateTime<Utc>,
        input: Option<Value>,
        output: Option<Value>,
        error: Option<&ActionError>,
        attempt: u32,
    ) -> Result<()> {
        let completed_at = Utc::now();
        let step = ExecutionStepLog {
            node_id: node.id.clone(),
            node_type: node.action.as_str().to_string(),
            node_label: node.label.clone(),
            status,
            started_at,
            completed_at: Some(completed_at),
            duration_ms: Some((completed_at - started_at).num_milliseconds()),
            input: input.filter(|v| !v.is_null()),
            output,
            error: error.map(|e| StepError {
                code: e.code.clone(),
                message: e.message.clone(),
                stack: e.stack.clone(),
            }),
            retry_attempt: Some(attempt),
        };
        self.engine.logs().append_step(&self.execution_id, &step).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visit_keys_number_revisits() {
        assert_eq!(visit_key("body", 1), "body");
        assert_eq!(visit_key("body", 2), "body#2");
        assert_eq!(visit_key("body", 10), "body#10");
    }

    #[test]
    fn partial_join_reports_waiting_barrier() {
        let mut state = RunState::new(Map::new());
        assert!(state.partial_join().is_none());
        state.join_arrivals.insert("merge".into(), 1);
        assert_eq!(state.partial_join(), Some("merge"));
    }
}
