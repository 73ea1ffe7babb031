/// Schedule state and its SQLite storage

use crate::database::timestamp;
use crate::history::ExecutionStatus;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    /// Turned off by a user
    Disabled,
    /// Turned off by the scheduler (failures, end date or run limit)
    Expired,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
            ScheduleStatus::Disabled => "disabled",
            ScheduleStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one cron trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    pub id: String,
    pub flow_name: String,
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub status: ScheduleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<ExecutionStatus>,
    #[serde(default)]
    pub total_runs: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Initial variables of every run this schedule starts
    #[serde(default)]
    pub params: Map<String, Value>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl ScheduleState {
    pub fn new(flow_name: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow_name: flow_name.into(),
            cron_expression: cron_expression.into(),
            timezone: default_timezone(),
            status: ScheduleStatus::Active,
            next_run_at: None,
            last_run_at: None,
            last_execution_id: None,
            last_run_status: None,
            total_runs: 0,
            consecutive_failures: 0,
            start_date: None,
            end_date: None,
            max_runs: None,
            created_at: Utc::now(),
            updated_at: None,
            created_by: None,
            params: Map::new(),
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn with_window(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn created_by(mut self, user: impl Into<String>) -> Self {
        self.created_by = Some(user.into());
        self
    }
}

/// SQLite-backed schedule storage
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    pool: SqlitePool,
}

impl ScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a schedule
    pub async fn save(&self, schedule: &ScheduleState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedule_states (id, flow_name, status, state, next_run_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                flow_name = excluded.flow_name,
                status = excluded.status,
                state = excluded.state,
                next_run_at = excluded.next_run_at
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.flow_name)
        .bind(schedule.status.as_str())
        .bind(serde_json::to_string(schedule)?)
        .bind(schedule.next_run_at.as_ref().map(timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduleState>> {
        let row = sqlx::query("SELECT state FROM schedule_states WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| schedule_from_row(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ScheduleState>> {
        let rows = sqlx::query("SELECT state FROM schedule_states ORDER BY flow_name, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    pub async fn list_for_flow(&self, flow_name: &str) -> Result<Vec<ScheduleState>> {
        let rows = sqlx::query("SELECT state FROM schedule_states WHERE flow_name = ? ORDER BY id")
            .bind(flow_name)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    /// Active schedules whose next fire time has come
    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleState>> {
        let rows = sqlx::query(
            r#"
            SELECT state FROM schedule_states
            WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?
            ORDER BY next_run_at
            "#,
        )
        .bind(timestamp(&now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedule_states WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn schedule_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduleState> {
    let json: String = row.get("state");
    Ok(serde_json::from_str(&json)?)
}
