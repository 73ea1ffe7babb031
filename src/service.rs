/// Flow management and run control surface
///
/// Everything an outer layer (HTTP, CLI, message consumer) needs: flow CRUD
/// with the draft/active/obsolete lifecycle, triggering, run history, run
/// control and schedule management. Storage and registry stay in sync on every
/// write so changes take effect for the next run without a restart.

use crate::error::{FlowError, FlowResult};
use crate::flow::{validate_flow, FlowDefinition, FlowStatus, FlowStorage, FlowSummary};
use crate::history::{ExecutionError, ExecutionLog, RunPage, RunQuery};
use crate::runtime::{Engine, ExecutionContext, ReconcileReport, ScheduleState, Scheduler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Result of `trigger_flow`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TriggerFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFailure {
    pub code: String,
    pub message: String,
}

#[derive(Clone)]
pub struct FlowService {
    engine: Engine,
    scheduler: Arc<Scheduler>,
}

impl FlowService {
    pub fn new(engine: Engine, scheduler: Arc<Scheduler>) -> Self {
        Self { engine, scheduler }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn storage(&self) -> &FlowStorage {
        self.engine.registry().storage()
    }

    /// Load flows into the registry and repair crash leftovers
    pub async fn init(&self) -> FlowResult<ReconcileReport> {
        self.engine.registry().init_from_storage().await?;
        self.engine.reconcile().await
    }

    pub async fn list_flows(&self) -> FlowResult<Vec<FlowSummary>> {
        Ok(self.storage().list_flows().await?)
    }

    pub async fn get_flow(&self, name: &str) -> FlowResult<FlowDefinition> {
        self.storage()
            .get_flow(name)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(name.to_string()))
    }

    /// Create a flow at version 1
    ///
    /// A definition submitted as `active` is validated and published right
    /// away; anything else starts as a draft.
    pub async fn create_flow(&self, mut flow: FlowDefinition) -> FlowResult<FlowDefinition> {
        if flow.name.trim().is_empty() {
            return Err(crate::error::ValidationError::EmptyName.into());
        }
        if self.storage().get_flow(&flow.name).await?.is_some() {
            return Err(FlowError::FlowExists(flow.name));
        }

        flow.version = 1;
        let publish = flow.status == FlowStatus::Active;
        flow.status = FlowStatus::Draft;
        tracing::info!(flow = %flow.name, "Creating flow");
        if publish {
            self.activate(flow).await
        } else {
            self.store(&flow).await?;
            Ok(flow)
        }
    }

    /// Replace a flow's definition
    ///
    /// The version is bumped when the graph or policies change. An active flow
    /// stays active only if the new definition validates.
    pub async fn update_flow(&self, name: &str, mut flow: FlowDefinition) -> FlowResult<FlowDefinition> {
        let existing = self.get_flow(name).await?;
        if existing.status == FlowStatus::Obsolete {
            return Err(FlowError::FlowImmutable(name.to_string()));
        }

        flow.name = name.to_string();
        flow.version = if flow.structurally_differs(&existing) {
            existing.version + 1
        } else {
            existing.version
        };
        tracing::info!(flow = name, version = flow.version, "Updating flow");

        if flow.status == FlowStatus::Active {
            self.activate(flow).await
        } else {
            if flow.status != FlowStatus::Invalid {
                flow.status = FlowStatus::Draft;
            }
            self.store(&flow).await?;
            Ok(flow)
        }
    }

    /// Remove a flow and its schedules; frozen versions keep pinned runs resumable
    pub async fn delete_flow(&self, name: &str) -> FlowResult<()> {
        if !self.storage().delete_flow(name).await? {
            return Err(FlowError::FlowNotFound(name.to_string()));
        }
        self.engine.registry().remove_flow(name);

        for schedule in self.scheduler.store().list_for_flow(name).await? {
            self.scheduler.unregister(&schedule.id).await?;
        }
        tracing::info!(flow = name, "Deleted flow");
        Ok(())
    }

    pub async fn toggle_flow(&self, name: &str, enabled: bool) -> FlowResult<FlowDefinition> {
        let mut flow = self.get_flow(name).await?;
        if flow.status == FlowStatus::Obsolete {
            return Err(FlowError::FlowImmutable(name.to_string()));
        }
        flow.enabled = enabled;
        self.store(&flow).await?;
        tracing::info!(flow = name, enabled, "Toggled flow");
        Ok(flow)
    }

    /// Validate and activate the current definition
    pub async fn publish_flow(&self, name: &str) -> FlowResult<FlowDefinition> {
        let flow = self.get_flow(name).await?;
        if flow.status == FlowStatus::Obsolete {
            return Err(FlowError::FlowImmutable(name.to_string()));
        }
        self.activate(flow).await
    }

    /// Mark a flow obsolete; it can no longer start runs or be edited
    pub async fn retire_flow(&self, name: &str) -> FlowResult<FlowDefinition> {
        let mut flow = self.get_flow(name).await?;
        flow.status = FlowStatus::Obsolete;
        self.store(&flow).await?;
        tracing::info!(flow = name, version = flow.version, "Retired flow");
        Ok(flow)
    }

    /// Admit a run and start it in the background
    ///
    /// Admission (including any queue wait) completes before this returns, so
    /// a refusal is reported here rather than in a run log.
    pub async fn trigger_flow(&self, name: &str, context: ExecutionContext) -> TriggerResponse {
        match self.engine.start(name, context).await {
            Ok(run) => {
                let execution_id = run.execution_id().to_string();
                tokio::spawn(async move {
                    let id = run.execution_id().to_string();
                    if let Err(e) = run.run().await {
                        tracing::error!(execution_id = %id, error = %e, "Triggered run aborted");
                    }
                });
                TriggerResponse {
                    success: true,
                    execution_id: Some(execution_id),
                    error: None,
                }
            }
            Err(e) => {
                tracing::info!(flow = name, code = e.code(), "Trigger refused");
                TriggerResponse {
                    success: false,
                    execution_id: None,
                    error: Some(TriggerFailure {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    }),
                }
            }
        }
    }

    /// Runs of a flow, newest first, with their steps and errors
    pub async fn list_runs(&self, flow_name: &str, query: &RunQuery) -> FlowResult<RunPage> {
        let mut page = self.engine.logs().list(flow_name, query).await?;
        for run in &mut page.runs {
            run.errors = self.engine.errors().list(&run.id).await?;
        }
        Ok(page)
    }

    pub async fn get_run(&self, flow_name: &str, execution_id: &str) -> FlowResult<ExecutionLog> {
        let log = self.engine.get_run(execution_id).await?;
        if log.flow_name != flow_name {
            return Err(FlowError::ExecutionNotFound(execution_id.to_string()));
        }
        Ok(log)
    }

    pub async fn resume_run(&self, execution_id: &str, node_id: Option<&str>, payload: Value) -> FlowResult<ExecutionLog> {
        self.engine.resume(execution_id, node_id, payload).await
    }

    pub async fn cancel_run(&self, execution_id: &str) -> FlowResult<()> {
        self.engine.cancel(execution_id).await
    }

    pub async fn pause_run(&self, execution_id: &str) -> FlowResult<()> {
        self.engine.pause(execution_id).await
    }

    pub async fn list_errors(&self, execution_id: &str) -> FlowResult<Vec<ExecutionError>> {
        Ok(self.engine.errors().list(execution_id).await?)
    }

    pub async fn create_schedule(&self, schedule: ScheduleState) -> FlowResult<ScheduleState> {
        self.scheduler.register(schedule).await
    }

    pub async fn list_schedules(&self) -> FlowResult<Vec<ScheduleState>> {
        self.scheduler.list().await
    }

    pub async fn pause_schedule(&self, id: &str) -> FlowResult<ScheduleState> {
        self.scheduler.pause(id).await
    }

    pub async fn resume_schedule(&self, id: &str) -> FlowResult<ScheduleState> {
        self.scheduler.resume(id).await
    }

    pub async fn disable_schedule(&self, id: &str) -> FlowResult<ScheduleState> {
        self.scheduler.disable(id).await
    }

    pub async fn delete_schedule(&self, id: &str) -> FlowResult<()> {
        self.scheduler.unregister(id).await
    }

    /// Validate, then either activate and freeze the version or mark invalid
    async fn activate(&self, mut flow: FlowDefinition) -> FlowResult<FlowDefinition> {
        if let Err(e) = validate_flow(&flow) {
            flow.status = FlowStatus::Invalid;
            self.store(&flow).await?;
            tracing::warn!(flow = %flow.name, code = e.code(), error = %e, "Flow failed validation");
            return Err(e.into());
        }

        flow.status = FlowStatus::Active;
        self.storage().save_version(&flow).await?;
        self.store(&flow).await?;
        tracing::info!(flow = %flow.name, version = flow.version, "🔥 Published flow");
        Ok(flow)
    }

    /// Persist and hot-swap into the registry
    async fn store(&self, flow: &FlowDefinition) -> FlowResult<()> {
        self.storage().save_flow(flow).await?;
        self.engine.registry().install(flow.clone());
        Ok(())
    }
}
