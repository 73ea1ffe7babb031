/// Execution log recorder
///
/// One `ExecutionLog` per run plus an append-only list of step logs. Only the
/// header's status, completion time, duration and variable snapshot are ever
/// updated in place; step rows are insert-only and ordered by their row id.

use crate::database::timestamp;
use crate::history::error_log::ExecutionError;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{sqlite::SqlitePool, Row, Sqlite, Transaction};
use std::fmt;
use std::str::FromStr;

/// Guard that keeps status updates off runs that already ended
const LIVE_ONLY: &str = "status NOT IN ('completed', 'failed', 'cancelled', 'timed_out')";

/// Run status state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    Retrying,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::TimedOut
        )
    }

    /// Failures as counted by schedule failure tracking
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::TimedOut)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => ExecutionStatus::Pending,
            "running" => ExecutionStatus::Running,
            "paused" => ExecutionStatus::Paused,
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            "cancelled" => ExecutionStatus::Cancelled,
            "timed_out" => ExecutionStatus::TimedOut,
            "retrying" => ExecutionStatus::Retrying,
            other => anyhow::bail!("unknown execution status '{}'", other),
        })
    }
}

/// Source that started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    RecordChange,
    Manual,
    Api,
    Schedule,
    Subflow,
}

/// Trigger context captured on the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Trigger {
    pub fn new(trigger_type: TriggerType) -> Self {
        Self {
            trigger_type,
            record_id: None,
            object: None,
            user_id: None,
            metadata: None,
        }
    }

    pub fn manual() -> Self {
        Self::new(TriggerType::Manual)
    }

    pub fn with_record(mut self, object: impl Into<String>, record_id: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunAs {
    #[default]
    System,
    User,
}

impl RunAs {
    fn as_str(&self) -> &'static str {
        match self {
            RunAs::System => "system",
            RunAs::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// One visited node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStepLog {
    pub node_id: String,
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_label: Option<String>,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
}

/// History of a single run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLog {
    pub id: String,
    pub flow_name: String,
    pub flow_version: u32,
    pub status: ExecutionStatus,
    pub trigger: Trigger,
    #[serde(default)]
    pub steps: Vec<ExecutionStepLog>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub run_as: RunAs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Admission key this run holds a slot under
    pub lock_key: String,
    /// Diagnostic records attached when the log is read back
    #[serde(default)]
    pub errors: Vec<ExecutionError>,
}

impl ExecutionLog {
    /// Steps for one node, in append order
    pub fn steps_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ExecutionStepLog> + 'a {
        self.steps.iter().filter(move |s| s.node_id == node_id)
    }
}

/// Query filter for run listings
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub status: Option<ExecutionStatus>,
    pub limit: u32,
    /// Opaque cursor returned as `next_cursor` by a previous page
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPage {
    pub runs: Vec<ExecutionLog>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// SQLite-backed execution log storage
#[derive(Debug, Clone)]
pub struct ExecutionLogStore {
    pool: SqlitePool,
}

impl ExecutionLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a new run header (steps are appended separately)
    pub async fn create(&self, log: &ExecutionLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs
                (id, flow_name, flow_version, status, lock_key, trigger, variables,
                 run_as, tenant_id, started_at, completed_at, duration_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.flow_name)
        .bind(log.flow_version as i64)
        .bind(log.status.as_str())
        .bind(&log.lock_key)
        .bind(serde_json::to_string(&log.trigger)?)
        .bind(serde_json::to_string(&log.variables)?)
        .bind(log.run_as.as_str())
        .bind(&log.tenant_id)
        .bind(timestamp(&log.started_at))
        .bind(log.completed_at.as_ref().map(timestamp))
        .bind(log.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_step(&self, execution_id: &str, step: &ExecutionStepLog) -> Result<()> {
        sqlx::query("INSERT INTO execution_steps (execution_id, step) VALUES (?, ?)")
            .bind(execution_id)
            .bind(serde_json::to_string(step)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a live run to `status`; returns false when the run already ended
    pub async fn set_status(&self, id: &str, status: ExecutionStatus) -> Result<bool> {
        let query = format!("UPDATE execution_logs SET status = ? WHERE id = ? AND {LIVE_ONLY}");
        let result = sqlx::query(&query)
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Compare-and-set on status; returns false when the run was not in `from`
    pub async fn transition(&self, id: &str, from: ExecutionStatus, to: ExecutionStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE execution_logs SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_variables(&self, id: &str, variables: &Map<String, Value>) -> Result<()> {
        sqlx::query("UPDATE execution_logs SET variables = ? WHERE id = ?")
            .bind(serde_json::to_string(variables)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a run into a terminal status; a run already terminal is left alone
    pub async fn finish(
        &self,
        id: &str,
        status: ExecutionStatus,
        variables: Option<&Map<String, Value>>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let changed = finish_in(&mut tx, id, status, variables).await?;
        tx.commit().await?;
        Ok(changed)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ExecutionLog>> {
        let row = sqlx::query("SELECT * FROM execution_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let mut log = log_from_row(&row)?;
                log.steps = self.steps(id).await?;
                Ok(Some(log))
            }
            None => Ok(None),
        }
    }

    pub async fn steps(&self, execution_id: &str) -> Result<Vec<ExecutionStepLog>> {
        let rows = sqlx::query("SELECT step FROM execution_steps WHERE execution_id = ? ORDER BY seq")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let json: String = row.get("step");
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }

    /// Page through runs of one flow, newest first
    pub async fn list(&self, flow_name: &str, query: &RunQuery) -> Result<RunPage> {
        let limit = query.limit.clamp(1, 500) as i64;
        let (cursor_started, cursor_id) = match &query.cursor {
            Some(cursor) => {
                let (started, id) = cursor
                    .split_once('|')
                    .ok_or_else(|| anyhow::anyhow!("malformed cursor '{}'", cursor))?;
                (Some(started.to_string()), Some(id.to_string()))
            }
            None => (None, None),
        };

        let rows = sqlx::query(
            r#"
            SELECT * FROM execution_logs
            WHERE flow_name = ?1
              AND (?2 IS NULL OR status = ?2)
              AND (?3 IS NULL OR started_at < ?3 OR (started_at = ?3 AND id < ?4))
            ORDER BY started_at DESC, id DESC
            LIMIT ?5
            "#,
        )
        .bind(flow_name)
        .bind(query.status.map(|s| s.as_str()))
        .bind(cursor_started)
        .bind(cursor_id)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as i64 > limit;
        let mut runs = Vec::with_capacity(rows.len().min(limit as usize));
        for row in rows.iter().take(limit as usize) {
            let mut log = log_from_row(row)?;
            log.steps = self.steps(&log.id).await?;
            runs.push(log);
        }

        let next_cursor = if has_more {
            runs.last()
                .map(|last| format!("{}|{}", timestamp(&last.started_at), last.id))
        } else {
            None
        };

        Ok(RunPage {
            runs,
            next_cursor,
            has_more,
        })
    }

    /// Run headers (without steps) in any of the given statuses
    pub async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<ExecutionLog>> {
        let mut logs = Vec::new();
        for status in statuses {
            let rows = sqlx::query("SELECT * FROM execution_logs WHERE status = ? ORDER BY started_at")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
            for row in &rows {
                logs.push(log_from_row(row)?);
            }
        }
        Ok(logs)
    }
}

/// Terminal transition inside a caller's transaction
pub(crate) async fn finish_in(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    status: ExecutionStatus,
    variables: Option<&Map<String, Value>>,
) -> Result<bool> {
    let row = sqlx::query("SELECT status, started_at FROM execution_logs WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else {
        return Ok(false);
    };

    let current: ExecutionStatus = row.get::<String, _>("status").parse()?;
    if current.is_terminal() {
        return Ok(false);
    }

    let started_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&row.get::<String, _>("started_at"))?.with_timezone(&Utc);
    let completed_at = Utc::now();
    let duration_ms = (completed_at - started_at).num_milliseconds();

    let variables_json = match variables {
        Some(vars) => Some(serde_json::to_string(vars)?),
        None => None,
    };

    sqlx::query(
        r#"
        UPDATE execution_logs
        SET status = ?, completed_at = ?, duration_ms = ?, variables = COALESCE(?, variables)
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(timestamp(&completed_at))
    .bind(duration_ms)
    .bind(variables_json)
    .bind(id)
    .execute(&mut **tx)
    .await?;

    Ok(true)
}

/// Status update inside a caller's transaction; terminal runs are left alone
pub(crate) async fn set_status_in(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    status: ExecutionStatus,
    variables: Option<&Map<String, Value>>,
) -> Result<bool> {
    let variables_json = match variables {
        Some(vars) => Some(serde_json::to_string(vars)?),
        None => None,
    };
    let query = format!(
        "UPDATE execution_logs SET status = ?, variables = COALESCE(?, variables) WHERE id = ? AND {LIVE_ONLY}"
    );
    let result = sqlx::query(&query)
        .bind(status.as_str())
        .bind(variables_json)
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() > 0)
}

fn log_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionLog> {
    let parse_ts = |s: String| -> Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc))
    };

    let run_as = match row.get::<String, _>("run_as").as_str() {
        "user" => RunAs::User,
        _ => RunAs::System,
    };

    Ok(ExecutionLog {
        id: row.get("id"),
        flow_name: row.get("flow_name"),
        flow_version: row.get::<i64, _>("flow_version") as u32,
        status: row.get::<String, _>("status").parse()?,
        trigger: serde_json::from_str(&row.get::<String, _>("trigger"))?,
        steps: Vec::new(),
        variables: serde_json::from_str(&row.get::<String, _>("variables"))?,
        started_at: parse_ts(row.get("started_at"))?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .map(parse_ts)
            .transpose()?,
        duration_ms: row.get("duration_ms"),
        run_as,
        tenant_id: row.get("tenant_id"),
        lock_key: row.get("lock_key"),
        errors: Vec::new(),
    })
}
