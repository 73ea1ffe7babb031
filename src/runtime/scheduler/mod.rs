/// Background cron scheduler service
///
/// Schedules live in the `schedule_states` table; a single repeated job on
/// tokio-cron-scheduler drives [`Scheduler::tick`], which fires due schedules
/// and runs the engine's housekeeping sweeps. A fire advances the schedule
/// before the run is admitted; the run's terminal outcome arrives later
/// through the engine's outcome channel and may expire the schedule.

pub mod cron;
pub mod store;

pub use store::{ScheduleState, ScheduleStatus, ScheduleStore};

use crate::config::SchedulerConfig;
use crate::database::Database;
use crate::error::{FlowError, FlowResult};
use crate::history::{ExecutionStatus, Trigger, TriggerType};
use crate::runtime::context::ExecutionContext;
use crate::runtime::engine::{Engine, RunOutcome};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};

/// One schedule fired by a tick
#[derive(Debug)]
pub struct ScheduleFire {
    pub schedule_id: String,
    task: JoinHandle<Option<String>>,
}

impl ScheduleFire {
    /// Wait until the run has ended and its outcome is recorded
    ///
    /// Returns the execution id, or None when admission refused the run.
    /// A run that stays paused keeps this pending.
    pub async fn completed(self) -> Option<String> {
        match self.task.await {
            Ok(execution_id) => execution_id,
            Err(e) => {
                tracing::error!(schedule_id = %self.schedule_id, error = %e, "Scheduled run task panicked");
                None
            }
        }
    }
}

/// Cron-driven flow trigger with durable run history
pub struct Scheduler {
    engine: Engine,
    store: ScheduleStore,
    config: SchedulerConfig,
    /// Serializes read-modify-write of schedule rows
    write_lock: Mutex<()>,
    jobs: RwLock<Option<JobScheduler>>,
    /// Fired runs whose terminal outcome is still awaited, by execution id
    waiters: std::sync::Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl Scheduler {
    /// Build the scheduler and start listening for run outcomes
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(database: &Database, engine: Engine, config: SchedulerConfig) -> Arc<Self> {
        let outcomes = engine.subscribe();
        Arc::new_cyclic(|this: &Weak<Self>| {
            tokio::spawn(listen(this.clone(), outcomes));
            Self {
                engine,
                store: ScheduleStore::new(database.pool().clone()),
                config,
                write_lock: Mutex::new(()),
                jobs: RwLock::new(None),
                waiters: std::sync::Mutex::new(HashMap::new()),
            }
        })
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    /// Start ticking once per configured interval
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.is_some() {
            return Ok(());
        }

        tracing::info!("⏰ Starting cron scheduler (tick every {}s)", self.config.tick_interval_secs);
        let scheduler = JobScheduler::new().await?;
        let this = Arc::clone(self);
        let interval = Duration::from_secs(self.config.tick_interval_secs.max(1));
        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                if let Err(e) = this.tick(Utc::now()).await {
                    tracing::error!(error = %e, "Scheduler tick failed");
                }
            })
        })?;
        scheduler.add(job).await?;
        scheduler.start().await?;
        *jobs = Some(scheduler);

        tracing::info!("✅ Cron scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(mut scheduler) = self.jobs.write().await.take() {
            scheduler.shutdown().await?;
            tracing::info!("⏹️ Cron scheduler stopped");
        }
        Ok(())
    }

    /// Add a schedule; validates the cron expression, timezone and flow
    pub async fn register(&self, mut schedule: ScheduleState) -> FlowResult<ScheduleState> {
        if self.engine.registry().get_flow(&schedule.flow_name).is_none() {
            return Err(FlowError::FlowNotFound(schedule.flow_name.clone()));
        }
        let now = Utc::now();
        let from = schedule.start_date.map_or(now, |start| start.max(now));
        schedule.next_run_at = Some(cron::next_fire(&schedule.cron_expression, &schedule.timezone, from)?);
        schedule.status = ScheduleStatus::Active;

        let _guard = self.write_lock.lock().await;
        self.store.save(&schedule).await?;
        tracing::info!(
            schedule_id = %schedule.id,
            flow = %schedule.flow_name,
            cron = %schedule.cron_expression,
            next_run_at = ?schedule.next_run_at,
            "Schedule registered"
        );
        Ok(schedule)
    }

    pub async fn unregister(&self, id: &str) -> FlowResult<()> {
        let _guard = self.write_lock.lock().await;
        if !self.store.delete(id).await? {
            return Err(FlowError::ScheduleNotFound(id.to_string()));
        }
        tracing::info!(schedule_id = id, "Schedule removed");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> FlowResult<ScheduleState> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| FlowError::ScheduleNotFound(id.to_string()))
    }

    pub async fn list(&self) -> FlowResult<Vec<ScheduleState>> {
        Ok(self.store.list().await?)
    }

    pub async fn pause(&self, id: &str) -> FlowResult<ScheduleState> {
        self.update_status(id, &[ScheduleStatus::Active], ScheduleStatus::Paused).await
    }

    /// Reactivate a paused schedule; missed fires are skipped
    pub async fn resume(&self, id: &str) -> FlowResult<ScheduleState> {
        self.update_status(id, &[ScheduleStatus::Paused], ScheduleStatus::Active).await
    }

    pub async fn disable(&self, id: &str) -> FlowResult<ScheduleState> {
        self.update_status(
            id,
            &[ScheduleStatus::Active, ScheduleStatus::Paused, ScheduleStatus::Expired],
            ScheduleStatus::Disabled,
        )
        .await
    }

    async fn update_status(&self, id: &str, from: &[ScheduleStatus], to: ScheduleStatus) -> FlowResult<ScheduleState> {
        let _guard = self.write_lock.lock().await;
        let mut schedule = self.get(id).await?;
        if !from.contains(&schedule.status) {
            return Err(FlowError::InvalidSchedule(format!(
                "schedule {id} cannot become {to} from {}",
                schedule.status
            )));
        }

        let now = Utc::now();
        schedule.status = to;
        schedule.updated_at = Some(now);
        schedule.next_run_at = match to {
            ScheduleStatus::Active => Some(cron::next_fire(&schedule.cron_expression, &schedule.timezone, now)?),
            _ => schedule.next_run_at,
        };
        self.store.save(&schedule).await?;
        tracing::info!(schedule_id = id, status = %to, "Schedule status changed");
        Ok(schedule)
    }

    /// Fire every due schedule and run the engine sweeps
    ///
    /// Each due schedule is advanced before its run is admitted, so an
    /// overlapping tick never fires it twice. Admission and the run continue
    /// on their own tasks.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> FlowResult<Vec<ScheduleFire>> {
        self.sweep(now).await;

        let due = self.store.list_due(now).await?;
        let mut fired = Vec::with_capacity(due.len());
        for schedule in due {
            if let Some(fire) = self.fire(&schedule.id, now).await? {
                fired.push(fire);
            }
        }
        Ok(fired)
    }

    async fn sweep(&self, now: DateTime<Utc>) {
        match self.engine.fire_due_timers(now).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(count = n, "Fired due timers"),
            Err(e) => tracing::error!(error = %e, "Timer sweep failed"),
        }
        match self.engine.enforce_timeouts(now).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "Timed out paused runs"),
            Err(e) => tracing::error!(error = %e, "Timeout sweep failed"),
        }
        match self.engine.cleanup_expired_checkpoints(now).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "Cleaned up expired checkpoints"),
            Err(e) => tracing::error!(error = %e, "Checkpoint cleanup failed"),
        }
    }

    async fn fire(self: &Arc<Self>, schedule_id: &str, now: DateTime<Utc>) -> FlowResult<Option<ScheduleFire>> {
        let guard = self.write_lock.lock().await;
        // Reload: another tick or an outcome may have written since the due scan
        let Some(mut schedule) = self.store.get(schedule_id).await? else {
            return Ok(None);
        };
        let still_due = schedule.status == ScheduleStatus::Active && schedule.next_run_at.is_some_and(|at| at <= now);
        if !still_due {
            return Ok(None);
        }

        if schedule.start_date.is_some_and(|start| now < start) {
            schedule.next_run_at = schedule
                .start_date
                .map(|start| cron::next_fire(&schedule.cron_expression, &schedule.timezone, start))
                .transpose()?;
            self.store.save(&schedule).await?;
            return Ok(None);
        }
        if self.expire_if_due(&mut schedule, now) {
            self.store.save(&schedule).await?;
            return Ok(None);
        }

        schedule.last_run_at = Some(now);
        schedule.total_runs += 1;
        // Fire once on recovery: the next slot is computed from now, skipping missed ones
        schedule.next_run_at = Some(cron::next_fire(&schedule.cron_expression, &schedule.timezone, now)?);
        self.expire_if_due(&mut schedule, now);
        self.store.save(&schedule).await?;
        drop(guard);

        tracing::info!(schedule_id = %schedule.id, flow = %schedule.flow_name, "🔔 Schedule fired");
        let this = Arc::clone(self);
        let schedule_id = schedule.id.clone();
        let task = tokio::spawn(async move { this.run_scheduled(schedule).await });
        Ok(Some(ScheduleFire { schedule_id, task }))
    }

    /// Admit and walk one scheduled run, then wait for its terminal outcome
    async fn run_scheduled(&self, schedule: ScheduleState) -> Option<String> {
        let context = ExecutionContext::new(
            Trigger::new(TriggerType::Schedule).with_metadata(json!({ "scheduleId": schedule.id })),
        )
        .with_params(schedule.params.clone());

        let run = match self.engine.start(&schedule.flow_name, context).await {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(schedule_id = %schedule.id, error = %e, "Scheduled run refused at admission");
                if let Err(e) = self.record_outcome(&schedule.id, ExecutionStatus::Failed).await {
                    tracing::error!(schedule_id = %schedule.id, error = %e, "Failed to record refused run");
                }
                return None;
            }
        };

        let execution_id = run.execution_id().to_string();
        let (tx, ended) = oneshot::channel();
        self.lock_waiters().insert(execution_id.clone(), tx);
        if let Err(e) = self.set_last_execution(&schedule.id, &execution_id).await {
            tracing::error!(schedule_id = %schedule.id, error = %e, "Failed to record scheduled execution id");
        }

        if let Err(e) = run.run().await {
            tracing::error!(schedule_id = %schedule.id, error = %e, "Scheduled run aborted");
        }
        // Resolves once the listener recorded the terminal outcome
        if ended.await.is_err() {
            tracing::debug!(execution_id = %execution_id, "Scheduled run outcome wait dropped");
        }
        Some(execution_id)
    }

    async fn set_last_execution(&self, schedule_id: &str, execution_id: &str) -> FlowResult<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(mut schedule) = self.store.get(schedule_id).await? {
            schedule.last_execution_id = Some(execution_id.to_string());
            self.store.save(&schedule).await?;
        }
        Ok(())
    }

    /// Fold a terminal run into its schedule, when it was fired by one
    async fn on_run_ended(&self, outcome: &RunOutcome) -> FlowResult<()> {
        let log = self.engine.logs().get(&outcome.execution_id).await?;
        let schedule_id = log
            .as_ref()
            .filter(|log| log.trigger.trigger_type == TriggerType::Schedule)
            .and_then(|log| log.trigger.metadata.as_ref())
            .and_then(|metadata| metadata.get("scheduleId"))
            .and_then(Value::as_str);
        if let Some(schedule_id) = schedule_id {
            self.record_outcome(schedule_id, outcome.status).await?;
        }

        if let Some(waiter) = self.lock_waiters().remove(&outcome.execution_id) {
            let _ = waiter.send(());
        }
        Ok(())
    }

    /// Outcome callback for a scheduled run
    async fn record_outcome(&self, schedule_id: &str, status: ExecutionStatus) -> FlowResult<()> {
        let _guard = self.write_lock.lock().await;
        let Some(mut schedule) = self.store.get(schedule_id).await? else {
            return Ok(());
        };
        apply_outcome(&mut schedule, status);
        self.expire_if_due(&mut schedule, Utc::now());
        schedule.updated_at = Some(Utc::now());
        self.store.save(&schedule).await?;
        tracing::debug!(
            schedule_id,
            status = %status,
            consecutive_failures = schedule.consecutive_failures,
            "Recorded scheduled run outcome"
        );
        Ok(())
    }

    fn lock_waiters(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move an active schedule to `expired` when one of its limits is hit
    fn expire_if_due(&self, schedule: &mut ScheduleState, now: DateTime<Utc>) -> bool {
        if schedule.status != ScheduleStatus::Active {
            return false;
        }
        let reason = if schedule.consecutive_failures >= self.config.failure_threshold {
            "failure threshold reached"
        } else if schedule.end_date.is_some_and(|end| now > end) {
            "end date passed"
        } else if schedule.max_runs.is_some_and(|max| schedule.total_runs >= max) {
            "run limit reached"
        } else {
            return false;
        };

        schedule.status = ScheduleStatus::Expired;
        schedule.next_run_at = None;
        schedule.updated_at = Some(now);
        tracing::info!(schedule_id = %schedule.id, flow = %schedule.flow_name, reason, "Schedule expired");
        true
    }
}

/// Drain the engine's outcome channel for as long as the scheduler lives
async fn listen(scheduler: Weak<Scheduler>, mut outcomes: broadcast::Receiver<RunOutcome>) {
    loop {
        let outcome = match outcomes.recv().await {
            Ok(outcome) => outcome,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Scheduler fell behind on run outcomes");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let Some(scheduler) = scheduler.upgrade() else {
            return;
        };
        if let Err(e) = scheduler.on_run_ended(&outcome).await {
            tracing::error!(execution_id = %outcome.execution_id, error = %e, "Failed to record run outcome");
        }
    }
}

/// Fold a terminal run outcome into the schedule's failure tracking
fn apply_outcome(schedule: &mut ScheduleState, status: ExecutionStatus) {
    if !status.is_terminal() {
        return;
    }
    schedule.last_run_status = Some(status);
    if status.is_failure() {
        schedule.consecutive_failures += 1;
    } else {
        schedule.consecutive_failures = 0;
    }
}
