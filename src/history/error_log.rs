/// Structured diagnostic records, kept apart from step logs

use crate::database::timestamp;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row, Sqlite, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ExecutionError {
    pub fn new(
        execution_id: impl Into<String>,
        severity: Severity,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.into(),
            node_id: None,
            severity,
            code: code.into(),
            message: message.into(),
            stack: None,
            context: None,
            timestamp: Utc::now(),
            retryable: false,
            resolved_at: None,
        }
    }

    pub fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Error recorder backed by the `execution_errors` table
#[derive(Debug, Clone)]
pub struct ErrorRecorder {
    pool: SqlitePool,
}

impl ErrorRecorder {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, error: &ExecutionError) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        record_in(&mut tx, error).await?;
        tx.commit().await?;

        match error.severity {
            Severity::Critical => tracing::error!(
                execution_id = %error.execution_id,
                node_id = ?error.node_id,
                code = %error.code,
                "{}",
                error.message
            ),
            _ => tracing::warn!(
                execution_id = %error.execution_id,
                node_id = ?error.node_id,
                code = %error.code,
                "{}",
                error.message
            ),
        }
        Ok(())
    }

    /// Errors of one run, oldest first
    pub async fn list(&self, execution_id: &str) -> Result<Vec<ExecutionError>> {
        let rows = sqlx::query(
            "SELECT record, resolved_at FROM execution_errors WHERE execution_id = ? ORDER BY timestamp, rowid",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let mut error: ExecutionError = serde_json::from_str(&row.get::<String, _>("record"))?;
                if let Some(resolved) = row.get::<Option<String>, _>("resolved_at") {
                    error.resolved_at = Some(DateTime::parse_from_rfc3339(&resolved)?.with_timezone(&Utc));
                }
                Ok(error)
            })
            .collect()
    }

    /// Mark unresolved errors of a node as resolved after a successful retry
    pub async fn resolve_node(&self, execution_id: &str, node_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE execution_errors SET resolved_at = ?
            WHERE execution_id = ? AND node_id = ? AND resolved_at IS NULL
            "#,
        )
        .bind(timestamp(&Utc::now()))
        .bind(execution_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Insert inside a caller's transaction
pub(crate) async fn record_in(tx: &mut Transaction<'_, Sqlite>, error: &ExecutionError) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO execution_errors (id, execution_id, node_id, severity, code, record, timestamp, resolved_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&error.id)
    .bind(&error.execution_id)
    .bind(&error.node_id)
    .bind(error.severity.as_str())
    .bind(&error.code)
    .bind(serde_json::to_string(error)?)
    .bind(timestamp(&error.timestamp))
    .bind(error.resolved_at.as_ref().map(timestamp))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[tokio::test]
    async fn resolve_marks_only_matching_node() {
        let db = Database::connect_in_memory().await.unwrap();
        let recorder = ErrorRecorder::new(db.pool().clone());

        let first = ExecutionError::new("run-1", Severity::Error, "http_5xx", "503")
            .at_node("call")
            .retryable(true);
        let other = ExecutionError::new("run-1", Severity::Warning, "slow", "took 4s").at_node("assign");
        recorder.record(&first).await.unwrap();
        recorder.record(&other).await.unwrap();

        assert_eq!(recorder.resolve_node("run-1", "call").await.unwrap(), 1);

        let errors = recorder.list("run-1").await.unwrap();
        assert_eq!(errors.len(), 2);
        let call = errors.iter().find(|e| e.code == "http_5xx").unwrap();
        assert!(call.resolved_at.is_some());
        assert!(call.retryable);
        let assign = errors.iter().find(|e| e.code == "slow").unwrap();
        assert!(assign.resolved_at.is_none());
    }

    #[test]
    fn severities_order_by_impact() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
    }
}
