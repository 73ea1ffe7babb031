/// SQLite persistence layer for flow definitions
///
/// The `flows` table holds the current editable definition per name. Every
/// published version is also frozen into `flow_versions`, so runs pinned to an
/// older version can still be resumed after the flow moved on.

use crate::database::timestamp;
use crate::flow::types::FlowDefinition;
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::{sqlite::SqlitePool, Row};

/// SQLite-based flow storage manager
#[derive(Debug, Clone)]
pub struct FlowStorage {
    pool: SqlitePool,
}

/// Flow metadata for listing operations
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub name: String,
    pub version: u32,
    pub status: String,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl FlowStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new flow or update an existing one
    ///
    /// Uses UPSERT so create and update share one code path; `created_at`
    /// survives updates.
    pub async fn save_flow(&self, flow: &FlowDefinition) -> Result<()> {
        let definition_json = serde_json::to_string(flow)?;
        let now = timestamp(&Utc::now());

        sqlx::query(
            r#"
            INSERT INTO flows (name, version, status, enabled, definition, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                version = excluded.version,
                status = excluded.status,
                enabled = excluded.enabled,
                definition = excluded.definition,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&flow.name)
        .bind(flow.version as i64)
        .bind(flow.status.as_str())
        .bind(flow.enabled)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Freeze a published version; republishing the same version overwrites it
    pub async fn save_version(&self, flow: &FlowDefinition) -> Result<()> {
        let definition_json = serde_json::to_string(flow)?;

        sqlx::query(
            r#"
            INSERT INTO flow_versions (name, version, definition, published_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name, version) DO UPDATE SET
                definition = excluded.definition
            "#,
        )
        .bind(&flow.name)
        .bind(flow.version as i64)
        .bind(&definition_json)
        .bind(timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve the current definition of a flow
    pub async fn get_flow(&self, name: &str) -> Result<Option<FlowDefinition>> {
        let row = sqlx::query("SELECT definition FROM flows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// Retrieve a specific published version
    pub async fn get_version(&self, name: &str, version: u32) -> Result<Option<FlowDefinition>> {
        let row = sqlx::query("SELECT definition FROM flow_versions WHERE name = ? AND version = ?")
            .bind(name)
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// List all flows with basic metadata
    pub async fn list_flows(&self) -> Result<Vec<FlowSummary>> {
        let rows = sqlx::query(
            "SELECT name, version, status, enabled, created_at, updated_at FROM flows ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut flows = Vec::with_capacity(rows.len());
        for row in rows {
            flows.push(FlowSummary {
                name: row.get("name"),
                version: row.get::<i64, _>("version") as u32,
                status: row.get("status"),
                enabled: row.get("enabled"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            });
        }

        Ok(flows)
    }

    /// Load every current definition for registry initialization
    pub async fn load_all_flows(&self) -> Result<Vec<FlowDefinition>> {
        let rows = sqlx::query("SELECT definition FROM flows")
            .fetch_all(&self.pool)
            .await?;

        let mut flows = Vec::with_capacity(rows.len());
        for row in rows {
            let definition_json: String = row.get("definition");
            flows.push(serde_json::from_str(&definition_json)?);
        }

        Ok(flows)
    }

    /// Delete a flow; frozen versions stay so pinned runs can still finish
    pub async fn delete_flow(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM flows WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
