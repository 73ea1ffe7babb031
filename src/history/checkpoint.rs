/// Checkpoint store for suspended runs
///
/// At most one checkpoint row exists per execution. A row with `consumed_at`
/// unset is *live*: the run is paused and may be resumed. Claiming a checkpoint
/// marks it consumed and flips the run to `running` in one transaction, so two
/// competing resume signals (an approval and a boundary timer, say) can never
/// both continue the same cursor. A consumed row is kept until the resumed
/// segment finishes; after a crash it is the replay point.

use crate::database::timestamp;
use crate::history::error_log::{record_in, ExecutionError};
use crate::history::log::{finish_in, set_status_in, ExecutionStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Wait,
    ScreenInput,
    Approval,
    Error,
    ManualPause,
    ParallelJoin,
    BoundaryEvent,
}

impl CheckpointReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointReason::Wait => "wait",
            CheckpointReason::ScreenInput => "screen_input",
            CheckpointReason::Approval => "approval",
            CheckpointReason::Error => "error",
            CheckpointReason::ManualPause => "manual_pause",
            CheckpointReason::ParallelJoin => "parallel_join",
            CheckpointReason::BoundaryEvent => "boundary_event",
        }
    }
}

impl fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a resumed branch picks up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// The node finished; continue along its outgoing edges
    AfterNode,
    /// The node has not run (or must run again); execute it first
    AtNode,
}

/// A suspended branch cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParkedNode {
    pub node_id: String,
    /// Visit key the branch was parked under (`node` or `node#k`)
    pub visit_key: String,
    pub reason: CheckpointReason,
    pub mode: ResumeMode,
    /// When the parked node started; its step is logged once it resumes
    pub started_at: DateTime<Utc>,
    /// Timer resume for `wait` nodes with a duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    /// Boundary event armed on this parked host, with its deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary_at: Option<DateTime<Utc>>,
}

impl ParkedNode {
    /// Earliest instant at which this cursor wakes up on its own
    pub fn wake_at(&self) -> Option<DateTime<Utc>> {
        match (self.resume_at, self.boundary_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Durable snapshot of a paused run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub execution_id: String,
    pub flow_name: String,
    pub flow_version: u32,
    /// Node the run is suspended on (the join for `parallel_join`)
    pub current_node_id: String,
    pub variables: Map<String, Value>,
    /// Visit keys that must never run again on replay
    pub completed_node_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: CheckpointReason,
    #[serde(default)]
    pub parked: Vec<ParkedNode>,
    #[serde(default)]
    pub join_arrivals: HashMap<String, u32>,
    /// Visit counter per node id, carried across loop iterations
    #[serde(default)]
    pub visits: HashMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn is_live(&self) -> bool {
        self.consumed_at.is_none()
    }

    pub fn parked_node(&self, node_id: &str) -> Option<&ParkedNode> {
        self.parked.iter().find(|p| p.node_id == node_id)
    }
}

/// SQLite-backed checkpoint store
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert keyed by execution id; replaces any prior checkpoint
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert(&mut tx, checkpoint).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn load(&self, execution_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query("SELECT checkpoint, consumed_at FROM checkpoints WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| checkpoint_from_row(&row)).transpose()
    }

    pub async fn delete(&self, execution_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Live checkpoints past their expiry
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT checkpoint, consumed_at FROM checkpoints
            WHERE consumed_at IS NULL AND expires_at IS NOT NULL AND expires_at <= ?
            ORDER BY expires_at
            "#,
        )
        .bind(timestamp(&now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    /// Live checkpoints with a timer or boundary deadline at or before `now`
    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT checkpoint, consumed_at FROM checkpoints
            WHERE consumed_at IS NULL AND resume_at IS NOT NULL AND resume_at <= ?
            ORDER BY resume_at
            "#,
        )
        .bind(timestamp(&now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    /// Every checkpoint row, live or consumed
    pub async fn list_all(&self) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query("SELECT checkpoint, consumed_at FROM checkpoints ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    /// Execution ids whose stored snapshot no longer decodes
    pub async fn list_corrupt(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT execution_id, checkpoint, consumed_at FROM checkpoints")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter(|row| checkpoint_from_row(row).is_err())
            .map(|row| row.get::<String, _>("execution_id"))
            .collect())
    }

    /// Write the checkpoint and move the run to `paused` atomically
    ///
    /// Returns false, writing nothing, when the run already ended.
    pub async fn suspend(&self, checkpoint: &Checkpoint) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        upsert(&mut tx, checkpoint).await?;
        let paused = set_status_in(
            &mut tx,
            &checkpoint.execution_id,
            ExecutionStatus::Paused,
            Some(&checkpoint.variables),
        )
        .await?;
        if !paused {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;

        tracing::info!(
            execution_id = %checkpoint.execution_id,
            node_id = %checkpoint.current_node_id,
            reason = %checkpoint.reason,
            "Execution suspended"
        );
        Ok(true)
    }

    /// Consume the live checkpoint and move the run to `running`
    ///
    /// Returns `None` when there is nothing to claim: no checkpoint, already
    /// consumed, or the run is no longer paused. Exactly one concurrent caller
    /// wins.
    pub async fn claim(&self, execution_id: &str) -> Result<Option<Checkpoint>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let consumed = sqlx::query(
            "UPDATE checkpoints SET consumed_at = ? WHERE execution_id = ? AND consumed_at IS NULL",
        )
        .bind(timestamp(&now))
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;
        if consumed.rows_affected() == 0 {
            return Ok(None);
        }

        let resumed = sqlx::query("UPDATE execution_logs SET status = ? WHERE id = ? AND status = ?")
            .bind(ExecutionStatus::Running.as_str())
            .bind(execution_id)
            .bind(ExecutionStatus::Paused.as_str())
            .execute(&mut *tx)
            .await?;
        if resumed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query("SELECT checkpoint, consumed_at FROM checkpoints WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_one(&mut *tx)
            .await?;
        let checkpoint = checkpoint_from_row(&row)?;
        tx.commit().await?;
        Ok(Some(checkpoint))
    }

    /// Undo a claim: checkpoint live again, run back to `paused`
    pub async fn rearm(&self, execution_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE checkpoints SET consumed_at = NULL WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;
        set_status_in(&mut tx, execution_id, ExecutionStatus::Paused, None).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop the checkpoint, end the run and record why, in one transaction
    ///
    /// Returns false when the run was already terminal.
    pub async fn terminate(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<&ExecutionError>,
        variables: Option<&Map<String, Value>>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM checkpoints WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;
        let changed = finish_in(&mut tx, execution_id, status, variables).await?;
        if changed {
            if let Some(error) = error {
                record_in(&mut tx, error).await?;
            }
        }
        tx.commit().await?;
        Ok(changed)
    }
}

async fn upsert(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, checkpoint: &Checkpoint) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO checkpoints
            (execution_id, id, flow_name, reason, checkpoint, created_at, expires_at, resume_at, consumed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(execution_id) DO UPDATE SET
            id = excluded.id,
            flow_name = excluded.flow_name,
            reason = excluded.reason,
            checkpoint = excluded.checkpoint,
            created_at = excluded.created_at,
            expires_at = excluded.expires_at,
            resume_at = excluded.resume_at,
            consumed_at = excluded.consumed_at
        "#,
    )
    .bind(&checkpoint.execution_id)
    .bind(&checkpoint.id)
    .bind(&checkpoint.flow_name)
    .bind(checkpoint.reason.as_str())
    .bind(serde_json::to_string(checkpoint)?)
    .bind(timestamp(&checkpoint.created_at))
    .bind(checkpoint.expires_at.as_ref().map(timestamp))
    .bind(checkpoint.resume_at.as_ref().map(timestamp))
    .bind(checkpoint.consumed_at.as_ref().map(timestamp))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn checkpoint_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
    let mut checkpoint: Checkpoint = serde_json::from_str(&row.get::<String, _>("checkpoint"))?;
    checkpoint.consumed_at = row
        .get::<Option<String>, _>("consumed_at")
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
        .transpose()?;
    Ok(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::history::error_log::{ErrorRecorder, Severity};
    use crate::history::log::{ExecutionLog, ExecutionLogStore, RunAs, Trigger};

    async fn setup() -> (Database, ExecutionLogStore, CheckpointStore) {
        let db = Database::connect_in_memory().await.unwrap();
        let logs = ExecutionLogStore::new(db.pool().clone());
        let checkpoints = CheckpointStore::new(db.pool().clone());
        logs.create(&ExecutionLog {
            id: "run-1".into(),
            flow_name: "approve_order".into(),
            flow_version: 1,
            status: ExecutionStatus::Running,
            trigger: Trigger::manual(),
            steps: vec![],
            variables: Map::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            run_as: RunAs::System,
            tenant_id: None,
            lock_key: "approve_order".into(),
            errors: vec![],
        })
        .await
        .unwrap();
        (db, logs, checkpoints)
    }

    fn checkpoint(resume_at: Option<DateTime<Utc>>) -> Checkpoint {
        let mut variables = Map::new();
        variables.insert("amount".into(), Value::from(5000));
        Checkpoint {
            id: "cp-1".into(),
            execution_id: "run-1".into(),
            flow_name: "approve_order".into(),
            flow_version: 1,
            current_node_id: "approval".into(),
            variables,
            completed_node_ids: vec!["start".into(), "check".into(), "approval".into()],
            created_at: Utc::now(),
            expires_at: None,
            reason: CheckpointReason::Approval,
            parked: vec![ParkedNode {
                node_id: "approval".into(),
                visit_key: "approval".into(),
                reason: CheckpointReason::Approval,
                mode: ResumeMode::AfterNode,
                started_at: Utc::now(),
                resume_at,
                boundary_node_id: None,
                boundary_at: None,
            }],
            join_arrivals: HashMap::new(),
            visits: HashMap::new(),
            resume_at,
            consumed_at: None,
        }
    }

    #[tokio::test]
    async fn suspend_pauses_log_with_checkpoint() {
        let (_db, logs, store) = setup().await;
        store.suspend(&checkpoint(None)).await.unwrap();

        let log = logs.get("run-1").await.unwrap().unwrap();
        assert_eq!(log.status, ExecutionStatus::Paused);
        assert_eq!(log.variables["amount"], 5000);

        let loaded = store.load("run-1").await.unwrap().unwrap();
        assert!(loaded.is_live());
        assert_eq!(loaded.reason, CheckpointReason::Approval);
    }

    #[tokio::test]
    async fn only_one_claim_wins() {
        let (_db, logs, store) = setup().await;
        store.suspend(&checkpoint(None)).await.unwrap();

        let first = store.claim("run-1").await.unwrap();
        let second = store.claim("run-1").await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(logs.get("run-1").await.unwrap().unwrap().status, ExecutionStatus::Running);

        store.rearm("run-1").await.unwrap();
        assert_eq!(logs.get("run-1").await.unwrap().unwrap().status, ExecutionStatus::Paused);
        assert!(store.claim("run-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn due_and_expired_listings_skip_consumed() {
        let (_db, _logs, store) = setup().await;
        let past = Utc::now() - chrono::Duration::seconds(5);
        let mut cp = checkpoint(Some(past));
        cp.expires_at = Some(past);
        store.suspend(&cp).await.unwrap();

        assert_eq!(store.list_due(Utc::now()).await.unwrap().len(), 1);
        assert_eq!(store.list_expired(Utc::now()).await.unwrap().len(), 1);
        assert!(store.list_due(past - chrono::Duration::seconds(1)).await.unwrap().is_empty());

        store.claim("run-1").await.unwrap();
        assert!(store.list_due(Utc::now()).await.unwrap().is_empty());
        assert!(store.list_expired(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminate_records_error_once() {
        let (db, logs, store) = setup().await;
        store.suspend(&checkpoint(None)).await.unwrap();

        let error = ExecutionError::new("run-1", Severity::Critical, "orphaned_pause", "no checkpoint");
        assert!(store.terminate("run-1", ExecutionStatus::Failed, Some(&error), None).await.unwrap());
        assert!(!store.terminate("run-1", ExecutionStatus::Cancelled, Some(&error), None).await.unwrap());

        assert!(store.load("run-1").await.unwrap().is_none());
        assert_eq!(logs.get("run-1").await.unwrap().unwrap().status, ExecutionStatus::Failed);
        let errors = ErrorRecorder::new(db.pool().clone()).list("run-1").await.unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn ended_runs_are_not_paused_again() {
        let (_db, logs, store) = setup().await;
        store.suspend(&checkpoint(None)).await.unwrap();
        store.terminate("run-1", ExecutionStatus::Cancelled, None, None).await.unwrap();

        // A walker that missed the cancel tries to park and then retry
        assert!(!store.suspend(&checkpoint(None)).await.unwrap());
        assert!(store.load("run-1").await.unwrap().is_none());
        assert!(!logs.set_status("run-1", ExecutionStatus::Retrying).await.unwrap());
        assert_eq!(logs.get("run-1").await.unwrap().unwrap().status, ExecutionStatus::Cancelled);
    }
}
