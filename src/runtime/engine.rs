/// Flow execution engine
///
/// Owns the lifecycle of runs: admission, walking, suspension and resumption,
/// cancellation, the periodic sweeps (timers, budgets, checkpoint expiry) and
/// startup reconciliation. Graph walking itself lives in [`crate::runtime::walker`].
///
/// Every path that moves a paused run forward first claims its checkpoint, so
/// a resume, a timer and a cancel racing on the same run cannot both win.

use crate::config::EngineConfig;
use crate::database::Database;
use crate::error::{FlowError, FlowResult};
use crate::flow::{CompiledFlow, FlowRegistry, FlowStatus};
use crate::history::{
    Checkpoint, CheckpointStore, ErrorRecorder, ExecutionError, ExecutionLog, ExecutionLogStore,
    ExecutionStatus, ParkedNode, ResumeMode, Severity,
};
use crate::runtime::actions::ActionRegistry;
use crate::runtime::collaborators::Collaborators;
use crate::runtime::concurrency::{lock_key, Admission, ConcurrencyController, SlotSnapshot};
use crate::runtime::context::{ExecutionContext, SubflowRunner};
use crate::runtime::walker::{Cursor, RunState, SegmentEnd, Walk};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Execution engine handle; cheap to clone
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    registry: Arc<FlowRegistry>,
    actions: ActionRegistry,
    services: Collaborators,
    logs: ExecutionLogStore,
    errors: ErrorRecorder,
    checkpoints: CheckpointStore,
    concurrency: ConcurrencyController,
    config: EngineConfig,
    /// Runs currently walking in this process
    active: Mutex<HashMap<String, CancellationToken>>,
    outcomes: broadcast::Sender<RunOutcome>,
    pause_requests: Mutex<HashSet<String>>,
}

/// Counts of what startup reconciliation repaired
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Live checkpoints whose run had moved on; run failed
    pub orphaned_checkpoints: usize,
    /// Claimed checkpoints whose resume never finished; made live again
    pub rearmed: usize,
    /// Checkpoints of finished or unknown runs
    pub deleted_checkpoints: usize,
    /// Non-terminal runs with nothing to resume from; run failed
    pub orphaned_runs: usize,
    /// Concurrency slots re-registered for paused runs
    pub restored_slots: usize,
    /// Undecodable checkpoints; run failed
    pub corrupt_checkpoints: usize,
}

/// A run reached a terminal status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
}

const OUTCOME_CAPACITY: usize = 256;

/// A run that holds its concurrency slot and a `pending` log, not yet walking
///
/// Dropping it without calling [`AdmittedRun::run`] leaks the slot until the
/// run is cancelled.
pub struct AdmittedRun {
    engine: Engine,
    flow: Arc<CompiledFlow>,
    execution_id: String,
    lock_key: String,
    started_at: DateTime<Utc>,
    context: ExecutionContext,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("actions", &self.inner.actions)
            .field("services", &self.inner.services)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Engine {
    /// Engine with the built-in actions and default collaborators
    pub fn new(database: &Database, registry: Arc<FlowRegistry>, config: EngineConfig) -> Self {
        Self::with_parts(
            database,
            registry,
            config,
            ActionRegistry::with_builtins(),
            Collaborators::default(),
        )
    }

    pub fn with_parts(
        database: &Database,
        registry: Arc<FlowRegistry>,
        config: EngineConfig,
        actions: ActionRegistry,
        services: Collaborators,
    ) -> Self {
        let pool = database.pool().clone();
        Self {
            inner: Arc::new(EngineInner {
                registry,
                actions,
                services,
                logs: ExecutionLogStore::new(pool.clone()),
                errors: ErrorRecorder::new(pool.clone()),
                checkpoints: CheckpointStore::new(pool),
                concurrency: ConcurrencyController::new(),
                config,
                active: Mutex::new(HashMap::new()),
                outcomes: broadcast::channel(OUTCOME_CAPACITY).0,
                pause_requests: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.inner.registry
    }

    pub fn logs(&self) -> &ExecutionLogStore {
        &self.inner.logs
    }

    pub fn errors(&self) -> &ErrorRecorder {
        &self.inner.errors
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.inner.checkpoints
    }

    pub(crate) fn concurrency(&self) -> &ConcurrencyController {
        &self.inner.concurrency
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn actions(&self) -> &ActionRegistry {
        &self.inner.actions
    }

    pub(crate) fn services(&self) -> &Collaborators {
        &self.inner.services
    }

    /// Receive every terminal transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RunOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// End a run in one transaction and announce it
    ///
    /// Returns false when the run had already ended; nothing is announced then.
    pub(crate) async fn end_run(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<&ExecutionError>,
        variables: Option<&Map<String, Value>>,
    ) -> anyhow::Result<bool> {
        let ended = self
            .inner
            .checkpoints
            .terminate(execution_id, status, error, variables)
            .await?;
        if ended {
            // No subscribers is fine
            let _ = self.inner.outcomes.send(RunOutcome {
                execution_id: execution_id.to_string(),
                status,
            });
        }
        Ok(ended)
    }

    /// Admission state per lock key
    pub async fn concurrency_snapshot(&self) -> HashMap<String, SlotSnapshot> {
        self.inner.concurrency.snapshot().await
    }

    /// Run a flow until it completes, fails or suspends
    pub async fn execute(&self, flow_name: &str, context: ExecutionContext) -> FlowResult<ExecutionLog> {
        self.start(flow_name, context).await?.run().await
    }

    /// Admit a run and create its log without walking it yet
    ///
    /// Waits in the admission queue when the flow's policy says so.
    pub async fn start(&self, flow_name: &str, context: ExecutionContext) -> FlowResult<AdmittedRun> {
        let flow = self
            .inner
            .registry
            .get_flow(flow_name)
            .ok_or_else(|| FlowError::FlowNotFound(flow_name.to_string()))?;
        if !flow.definition.enabled {
            return Err(FlowError::FlowDisabled(flow_name.to_string()));
        }
        if flow.definition.status != FlowStatus::Active {
            return Err(FlowError::FlowNotActive {
                name: flow_name.to_string(),
                status: flow.definition.status.to_string(),
            });
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let policy = &flow.definition.concurrency;
        let lock_key = lock_key(flow_name, policy.lock_scope, &context.trigger);
        let queue_timeout = policy.queue_timeout_ms.map(Duration::from_millis);
        let concurrency = &self.inner.concurrency;

        match concurrency.try_admit(flow_name, policy, &lock_key, &execution_id).await {
            Admission::Admitted => {}
            Admission::Rejected => {
                tracing::info!(flow = flow_name, lock_key = %lock_key, "Run rejected by concurrency limit");
                return Err(FlowError::ConcurrencyLimit { lock_key });
            }
            Admission::Queued { position, ticket } => {
                tracing::debug!(flow = flow_name, lock_key = %lock_key, position, "Run queued for admission");
                concurrency.wait(ticket, queue_timeout).await?;
            }
            Admission::CancelledExisting { execution_id: victim, ticket } => {
                tracing::info!(flow = flow_name, lock_key = %lock_key, victim = %victim, "Cancelling oldest run for newcomer");
                self.cancel_victim(&lock_key, &victim).await;
                concurrency.wait(ticket, queue_timeout).await?;
            }
        }

        let started_at = Utc::now();
        let log = ExecutionLog {
            id: execution_id.clone(),
            flow_name: flow_name.to_string(),
            flow_version: flow.version(),
            status: ExecutionStatus::Pending,
            trigger: context.trigger.clone(),
            steps: Vec::new(),
            variables: context.params.clone(),
            started_at,
            completed_at: None,
            duration_ms: None,
            run_as: context.run_as,
            tenant_id: context.tenant_id.clone(),
            lock_key: lock_key.clone(),
            errors: Vec::new(),
        };
        if let Err(e) = self.inner.logs.create(&log).await {
            concurrency.release(&lock_key, &execution_id).await;
            return Err(e.into());
        }

        Ok(AdmittedRun {
            engine: self.clone(),
            flow,
            execution_id,
            lock_key,
            started_at,
            context,
        })
    }

    /// Cancel a run on behalf of a cancel_existing newcomer
    ///
    /// A victim that holds its slot but has no log yet is between admission
    /// and log creation; retry until the log appears or the slot is gone.
    async fn cancel_victim(&self, lock_key: &str, victim: &str) {
        let concurrency = &self.inner.concurrency;
        loop {
            match self.cancel(victim).await {
                Ok(()) => return,
                Err(FlowError::ExecutionNotFound(_)) if concurrency.holds(lock_key, victim).await => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(FlowError::ExecutionNotFound(_)) | Err(FlowError::InvalidState { .. }) => {
                    concurrency.release(lock_key, victim).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(victim, error = %e, "Failed to cancel run; freeing its slot");
                    concurrency.release(lock_key, victim).await;
                    return;
                }
            }
        }
    }

    /// Continue a paused run
    ///
    /// `node_id` picks the parked node when several branches are parked.
    /// The payload is validated by the parked node before the checkpoint is
    /// claimed, so a rejected payload leaves the run paused.
    pub async fn resume(&self, execution_id: &str, node_id: Option<&str>, payload: Value) -> FlowResult<ExecutionLog> {
        let log = self.load_log(execution_id).await?;
        if log.status != ExecutionStatus::Paused {
            return Err(FlowError::InvalidState {
                execution_id: execution_id.to_string(),
                action: "resumed",
                status: log.status.to_string(),
            });
        }
        let checkpoint = self
            .inner
            .checkpoints
            .load(execution_id)
            .await?
            .filter(Checkpoint::is_live)
            .ok_or_else(|| FlowError::CheckpointNotFound(execution_id.to_string()))?;
        let flow = self.pinned_flow(&checkpoint.flow_name, checkpoint.flow_version).await?;

        let parked = match node_id {
            Some(node_id) => checkpoint.parked_node(node_id),
            None if checkpoint.parked.len() > 1 => {
                return Err(FlowError::InvalidState {
                    execution_id: execution_id.to_string(),
                    action: "resumed without a node id",
                    status: format!("paused on {} nodes", checkpoint.parked.len()),
                })
            }
            None => checkpoint.parked.first(),
        }
        .cloned()
        .ok_or_else(|| FlowError::CheckpointNotFound(execution_id.to_string()))?;

        let updates = match (parked.mode, flow.node(&parked.node_id)) {
            (ResumeMode::AfterNode, Some(node)) => match self.inner.actions.get(node.action) {
                Some(action) => action.on_resume(node, &payload).map_err(FlowError::ResumeRejected)?,
                None => payload_variables(&payload),
            },
            _ => payload_variables(&payload),
        };

        let Some(token) = self.register(execution_id) else {
            // Another resume or timer is already moving this run
            return Err(FlowError::CheckpointNotFound(execution_id.to_string()));
        };
        let Some(claimed) = self.claim(execution_id).await? else {
            self.unregister(execution_id);
            return Err(FlowError::CheckpointNotFound(execution_id.to_string()));
        };

        let mut state = RunState::from_checkpoint(&claimed);
        let Some(parked) = state.take_parked(&parked.visit_key) else {
            self.inner.checkpoints.rearm(execution_id).await?;
            self.unregister(execution_id);
            return Err(FlowError::CheckpointNotFound(execution_id.to_string()));
        };
        state.variables.extend(updates.clone());

        tracing::info!(execution_id, node_id = %parked.node_id, "Resuming execution");
        let walk = self.walk(flow, &log, state, token);
        let cursor = match parked.mode {
            ResumeMode::AfterNode => walk.resume_after(&parked, Value::Object(updates)).await,
            ResumeMode::AtNode => Ok(Cursor::Run {
                node_id: parked.node_id.clone(),
                visit_key: Some(parked.visit_key.clone()),
            }),
        };
        self.drive(walk, cursor.map(|c| vec![c])).await
    }

    /// Stop a run
    ///
    /// An active run is signalled and ends `cancelled` at its next node
    /// boundary; a paused or not-yet-started run is ended right away.
    pub async fn cancel(&self, execution_id: &str) -> FlowResult<()> {
        if let Some(token) = self.active_token(execution_id) {
            token.cancel();
            tracing::info!(execution_id, "Cancellation requested for active run");
            return Ok(());
        }

        let log = self.load_log(execution_id).await?;
        if log.status.is_terminal() {
            return Err(FlowError::InvalidState {
                execution_id: execution_id.to_string(),
                action: "cancelled",
                status: log.status.to_string(),
            });
        }

        if log.status == ExecutionStatus::Paused && self.claim(execution_id).await?.is_none() {
            // Lost the claim to a resume that is now walking
            return match self.active_token(execution_id) {
                Some(token) => {
                    token.cancel();
                    Ok(())
                }
                None => Err(FlowError::CheckpointNotFound(execution_id.to_string())),
            };
        }

        self.end_run(execution_id, ExecutionStatus::Cancelled, None, None).await?;
        self.inner.concurrency.release(&log.lock_key, execution_id).await;
        tracing::info!(execution_id, flow = %log.flow_name, "Execution cancelled");
        Ok(())
    }

    /// Ask an active run to park every branch at its next node
    pub async fn pause(&self, execution_id: &str) -> FlowResult<()> {
        if self.active_token(execution_id).is_some() {
            self.lock_pause_requests().insert(execution_id.to_string());
            tracing::info!(execution_id, "Pause requested");
            return Ok(());
        }
        let log = self.load_log(execution_id).await?;
        Err(FlowError::InvalidState {
            execution_id: execution_id.to_string(),
            action: "paused",
            status: log.status.to_string(),
        })
    }

    /// Run log with its steps and error records
    pub async fn get_run(&self, execution_id: &str) -> FlowResult<ExecutionLog> {
        let mut log = self.load_log(execution_id).await?;
        log.errors = self.inner.errors.list(execution_id).await?;
        Ok(log)
    }

    /// Wake parked branches whose timer or boundary deadline has passed
    ///
    /// Returns how many runs were moved forward.
    pub async fn fire_due_timers(&self, now: DateTime<Utc>) -> FlowResult<usize> {
        let due = self.inner.checkpoints.list_due(now).await?;
        let fired = join_all(due.iter().map(|cp| self.fire_checkpoint(cp, now))).await;

        let mut count = 0;
        for (checkpoint, result) in due.iter().zip(fired) {
            match result {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(
                    execution_id = %checkpoint.execution_id,
                    error = %e,
                    "Failed to fire due timer"
                ),
            }
        }
        Ok(count)
    }

    async fn fire_checkpoint(&self, checkpoint: &Checkpoint, now: DateTime<Utc>) -> FlowResult<bool> {
        let execution_id = checkpoint.execution_id.as_str();
        let flow = self.pinned_flow(&checkpoint.flow_name, checkpoint.flow_version).await?;
        let log = self.load_log(execution_id).await?;

        let Some(token) = self.register(execution_id) else {
            return Ok(false);
        };
        let Some(claimed) = self.claim(execution_id).await? else {
            self.unregister(execution_id);
            return Ok(false);
        };

        let mut state = RunState::from_checkpoint(&claimed);
        let due: Vec<ParkedNode> = state
            .parked
            .iter()
            .filter(|p| p.wake_at().is_some_and(|at| at <= now))
            .cloned()
            .collect();
        if due.is_empty() {
            self.inner.checkpoints.rearm(execution_id).await?;
            self.unregister(execution_id);
            return Ok(false);
        }
        for parked in &due {
            state.take_parked(&parked.visit_key);
        }

        let walk = self.walk(flow, &log, state, token);
        let mut cursors = Vec::with_capacity(due.len());
        let mut prepared = Ok(());
        for parked in &due {
            let cursor = match boundary_wins(parked, now) {
                Some(boundary_id) => walk.fire_boundary(parked, &boundary_id).await,
                None if parked.mode == ResumeMode::AtNode => Ok(Cursor::Run {
                    node_id: parked.node_id.clone(),
                    visit_key: Some(parked.visit_key.clone()),
                }),
                None => walk.resume_after(parked, json!({ "resumedAt": now })).await,
            };
            match cursor {
                Ok(cursor) => cursors.push(cursor),
                Err(e) => {
                    prepared = Err(e);
                    break;
                }
            }
        }
        self.drive(walk, prepared.map(|_| cursors)).await?;
        Ok(true)
    }

    /// Time out paused runs whose execution budget has elapsed
    pub async fn enforce_timeouts(&self, now: DateTime<Utc>) -> FlowResult<usize> {
        let paused = self.inner.logs.list_by_status(&[ExecutionStatus::Paused]).await?;
        let mut count = 0;
        for log in paused {
            let flow = self.inner.registry.get_version(&log.flow_name, log.flow_version).await?;
            let budget = flow
                .as_ref()
                .and_then(|f| f.definition.timeout_ms)
                .or(self.inner.config.execution_budget_ms);
            let Some(budget) = budget else { continue };
            if log.started_at + chrono::Duration::milliseconds(budget as i64) > now {
                continue;
            }
            if self.claim(&log.id).await?.is_none() {
                continue;
            }

            let record = ExecutionError::new(
                &log.id,
                Severity::Critical,
                "execution_timeout",
                format!("execution budget of {budget}ms elapsed while paused"),
            );
            self.end_run(&log.id, ExecutionStatus::TimedOut, Some(&record), None).await?;
            self.inner.concurrency.release(&log.lock_key, &log.id).await;
            tracing::warn!(execution_id = %log.id, flow = %log.flow_name, "Paused execution timed out");
            count += 1;
        }
        Ok(count)
    }

    /// Cancel runs whose checkpoint outlived its TTL
    pub async fn cleanup_expired_checkpoints(&self, now: DateTime<Utc>) -> FlowResult<usize> {
        let expired = self.inner.checkpoints.list_expired(now).await?;
        let mut count = 0;
        for checkpoint in expired {
            let id = checkpoint.execution_id.as_str();
            let Some(log) = self.inner.logs.get(id).await? else {
                self.inner.checkpoints.delete(id).await?;
                continue;
            };
            if self.claim(id).await?.is_none() {
                continue;
            }

            let record = ExecutionError::new(
                id,
                Severity::Error,
                "checkpoint_expired",
                format!("checkpoint {} expired before the run was resumed", checkpoint.id),
            )
            .at_node(&checkpoint.current_node_id);
            self.end_run(id, ExecutionStatus::Cancelled, Some(&record), None).await?;
            self.inner.concurrency.release(&log.lock_key, id).await;
            tracing::info!(execution_id = id, "Expired checkpoint cleaned up");
            count += 1;
        }
        Ok(count)
    }

    /// Repair state left behind by a crash; call once at startup before
    /// accepting work
    pub async fn reconcile(&self) -> FlowResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for id in self.inner.checkpoints.list_corrupt().await? {
            let record = ExecutionError::new(
                &id,
                Severity::Critical,
                "corrupt_checkpoint",
                "checkpoint snapshot could not be decoded",
            );
            self.end_run(&id, ExecutionStatus::Failed, Some(&record), None).await?;
            tracing::error!(execution_id = %id, "Failed run with corrupt checkpoint");
            report.corrupt_checkpoints += 1;
        }

        let checkpoints = self.inner.checkpoints.list_all().await?;
        let mut covered = HashSet::new();

        for checkpoint in checkpoints {
            let id = checkpoint.execution_id.as_str();
            let Some(log) = self.inner.logs.get(id).await? else {
                self.inner.checkpoints.delete(id).await?;
                report.deleted_checkpoints += 1;
                continue;
            };

            if log.status.is_terminal() {
                self.inner.checkpoints.delete(id).await?;
                report.deleted_checkpoints += 1;
                continue;
            }
            covered.insert(id.to_string());

            match (checkpoint.is_live(), log.status) {
                (true, ExecutionStatus::Paused) => {}
                (true, status) => {
                    let record = ExecutionError::new(
                        id,
                        Severity::Critical,
                        "orphaned_pause",
                        format!("checkpoint found for run in status {status}"),
                    );
                    self.end_run(id, ExecutionStatus::Failed, Some(&record), None).await?;
                    report.orphaned_checkpoints += 1;
                }
                (false, _) => {
                    self.inner.checkpoints.rearm(id).await?;
                    tracing::info!(execution_id = id, "Rearmed interrupted resume");
                    report.rearmed += 1;
                }
            }
        }

        let open = self
            .inner
            .logs
            .list_by_status(&[
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Retrying,
                ExecutionStatus::Paused,
            ])
            .await?;
        for log in open.iter().filter(|l| !covered.contains(&l.id)) {
            let code = match log.status {
                ExecutionStatus::Paused => "orphaned_pause",
                _ => "orphaned_run",
            };
            let record = ExecutionError::new(
                &log.id,
                Severity::Critical,
                code,
                format!("run found in status {} with nothing to resume from", log.status),
            );
            self.end_run(&log.id, ExecutionStatus::Failed, Some(&record), None).await?;
            report.orphaned_runs += 1;
        }

        for log in self.inner.logs.list_by_status(&[ExecutionStatus::Paused]).await? {
            let policy = match self.inner.registry.get_version(&log.flow_name, log.flow_version).await? {
                Some(flow) => flow.definition.concurrency.clone(),
                None => Default::default(),
            };
            self.inner.concurrency.restore(&log.lock_key, &log.id, &policy).await;
            report.restored_slots += 1;
        }

        tracing::info!(?report, "Reconciliation finished");
        Ok(report)
    }

    pub(crate) fn pause_requested(&self, execution_id: &str) -> bool {
        self.lock_pause_requests().contains(execution_id)
    }

    fn walk(&self, flow: Arc<CompiledFlow>, log: &ExecutionLog, state: RunState, token: CancellationToken) -> Walk {
        let run = ExecutionContext {
            trigger: log.trigger.clone(),
            params: Map::new(),
            run_as: log.run_as,
            tenant_id: log.tenant_id.clone(),
            depth: 0,
        };
        Walk {
            engine: self.clone(),
            flow,
            execution_id: log.id.clone(),
            lock_key: log.lock_key.clone(),
            started_at: log.started_at,
            run,
            state: tokio::sync::Mutex::new(state),
            token,
        }
    }

    /// Walk a prepared segment and clean up after it
    async fn drive(&self, walk: Walk, cursors: anyhow::Result<Vec<Cursor>>) -> FlowResult<ExecutionLog> {
        let execution_id = walk.execution_id.clone();
        let lock_key = walk.lock_key.clone();

        let result = match cursors {
            Ok(cursors) => walk.drive(cursors).await,
            Err(e) => Err(e),
        };
        self.unregister(&execution_id);

        match result {
            Ok(SegmentEnd::Suspended) | Ok(SegmentEnd::Finished(_)) => self.get_run(&execution_id).await,
            Err(e) => {
                tracing::error!(execution_id = %execution_id, error = %e, "Execution aborted by engine fault");
                let record = ExecutionError::new(&execution_id, Severity::Critical, "engine_fault", e.to_string());
                if let Err(term) = self
                    .end_run(&execution_id, ExecutionStatus::Failed, Some(&record), None)
                    .await
                {
                    tracing::error!(execution_id = %execution_id, error = %term, "Failed to record engine fault");
                }
                self.inner.concurrency.release(&lock_key, &execution_id).await;
                Err(FlowError::Storage(e))
            }
        }
    }

    async fn claim(&self, execution_id: &str) -> FlowResult<Option<Checkpoint>> {
        Ok(self.inner.checkpoints.claim(execution_id).await?)
    }

    async fn load_log(&self, execution_id: &str) -> FlowResult<ExecutionLog> {
        self.inner
            .logs
            .get(execution_id)
            .await?
            .ok_or_else(|| FlowError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn pinned_flow(&self, name: &str, version: u32) -> FlowResult<Arc<CompiledFlow>> {
        self.inner
            .registry
            .get_version(name, version)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(format!("{name}@{version}")))
    }

    /// Mark a run as walking in this process
    ///
    /// Returns None when another caller already holds the run; only the
    /// holder may unregister it.
    fn register(&self, execution_id: &str) -> Option<CancellationToken> {
        match self.lock_active().entry(execution_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(slot.insert(CancellationToken::new()).clone()),
        }
    }

    fn unregister(&self, execution_id: &str) {
        self.lock_active().remove(execution_id);
        self.lock_pause_requests().remove(execution_id);
    }

    fn active_token(&self, execution_id: &str) -> Option<CancellationToken> {
        self.lock_active().get(execution_id).cloned()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.inner.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pause_requests(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.inner.pause_requests.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AdmittedRun {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn flow_name(&self) -> &str {
        self.flow.name()
    }

    /// Walk the run from its start node
    pub async fn run(self) -> FlowResult<ExecutionLog> {
        let engine = self.engine.clone();
        let id = self.execution_id.clone();
        let Some(token) = engine.register(&id) else {
            return engine.get_run(&id).await;
        };

        let started = engine
            .logs()
            .transition(&id, ExecutionStatus::Pending, ExecutionStatus::Running)
            .await;
        match started {
            Ok(true) => {}
            Ok(false) => {
                // Cancelled between admission and start
                engine.unregister(&id);
                engine.concurrency().release(&self.lock_key, &id).await;
                return engine.get_run(&id).await;
            }
            Err(e) => {
                engine.unregister(&id);
                engine.concurrency().release(&self.lock_key, &id).await;
                return Err(e.into());
            }
        }

        tracing::info!(
            execution_id = %id,
            flow = self.flow.name(),
            version = self.flow.version(),
            trigger = ?self.context.trigger.trigger_type,
            "Starting execution"
        );

        let start = self.flow.start_node().map(|n| n.id.clone());
        let walk = Walk {
            engine: engine.clone(),
            flow: self.flow,
            execution_id: id.clone(),
            lock_key: self.lock_key,
            started_at: self.started_at,
            state: tokio::sync::Mutex::new(RunState::new(self.context.params.clone())),
            run: self.context,
            token,
        };
        let cursors = start
            .map(|start| vec![Cursor::run(start)])
            .ok_or_else(|| anyhow::anyhow!("flow has no start node"));
        engine.drive(walk, cursors).await
    }
}

#[async_trait]
impl SubflowRunner for Engine {
    async fn run_subflow(&self, flow_name: &str, context: ExecutionContext) -> Result<ExecutionLog, FlowError> {
        self.execute(flow_name, context).await
    }
}

/// Variables a resume payload contributes when the node has no opinion
fn payload_variables(payload: &Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("resumePayload".into(), other.clone());
            map
        }
    }
}

/// Boundary node to take when its deadline passed no later than the timer
fn boundary_wins(parked: &ParkedNode, now: DateTime<Utc>) -> Option<String> {
    let boundary_at = parked.boundary_at.filter(|at| *at <= now)?;
    if parked.resume_at.is_some_and(|resume_at| resume_at < boundary_at) {
        return None;
    }
    parked.boundary_node_id.clone()
}
