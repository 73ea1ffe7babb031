/// Database bootstrap for durable engine state
///
/// One SQLite database holds flows, execution history, checkpoints and
/// schedules. Keeping them together lets a checkpoint write and the paused
/// status transition share a single transaction.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Owner of the engine connection pool
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) `{data_dir}/mechaflow.db` and initialize the schema
    pub async fn connect(data_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", data_dir, e))?;
        let db_path = Path::new(data_dir).join("mechaflow.db");

        tracing::info!("Opening engine database: {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Private in-memory database, used by tests and ephemeral runs
    ///
    /// Pinned to one connection that never expires: every new SQLite memory
    /// connection would otherwise see its own empty database.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create all tables and indexes (safe to call repeatedly)
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS flows (
                name TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                definition JSON NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS flow_versions (
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                definition JSON NOT NULL,
                published_at TEXT NOT NULL,
                PRIMARY KEY (name, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                id TEXT PRIMARY KEY,
                flow_name TEXT NOT NULL,
                flow_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                lock_key TEXT NOT NULL,
                trigger JSON NOT NULL,
                variables JSON NOT NULL,
                run_as TEXT NOT NULL,
                tenant_id TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                duration_ms INTEGER
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_execution_logs_flow
            ON execution_logs(flow_name, started_at)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_execution_logs_status
            ON execution_logs(status)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_steps (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                step JSON NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_execution_steps_execution
            ON execution_steps(execution_id, seq)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_errors (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                node_id TEXT,
                severity TEXT NOT NULL,
                code TEXT NOT NULL,
                record JSON NOT NULL,
                timestamp TEXT NOT NULL,
                resolved_at TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_execution_errors_execution
            ON execution_errors(execution_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                execution_id TEXT PRIMARY KEY,
                id TEXT NOT NULL,
                flow_name TEXT NOT NULL,
                reason TEXT NOT NULL,
                checkpoint JSON NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                resume_at TEXT,
                consumed_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS schedule_states (
                id TEXT PRIMARY KEY,
                flow_name TEXT NOT NULL,
                status TEXT NOT NULL,
                state JSON NOT NULL,
                next_run_at TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_schedule_states_flow
            ON schedule_states(flow_name)
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

/// Fixed-width UTC timestamp so that TEXT columns compare chronologically
pub fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_schema().await.unwrap();
        db.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn file_database_is_created_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("engine");
        let _db = Database::connect(data_dir.to_str().unwrap()).await.unwrap();
        assert!(data_dir.join("mechaflow.db").exists());
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(timestamp(&early) < timestamp(&late));
        assert!(timestamp(&early).ends_with('Z'));
    }
}
