use anyhow::{Context, Result};
use chrono::Utc;
use cloudhop_contract::{decode_snapshot, encode_snapshot, MigrationRequest, WorkflowState};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::fmt;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub run_id: String,
    pub instance_name: String,
    pub tenant_name: String,
    pub status: String,
    pub request_json: String,
    pub submitted_at: String,
    pub updated_at: String,
    pub failure_reason: Option<String>,
}

impl RunRecord {
    pub fn request(&self) -> Result<MigrationRequest> {
        serde_json::from_str(&self.request_json)
            .with_context(|| format!("parse stored request for run {}", self.run_id))
    }
}

#[derive(Debug, Clone, FromRow)]
struct CheckpointRow {
    run_id: String,
    state_blob: Vec<u8>,
    completed_steps_json: String,
    last_step: Option<String>,
    saved_at: String,
}

/// The last persisted snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointRecord {
    pub run_id: String,
    pub state: WorkflowState,
    pub completed_steps: Vec<String>,
    pub last_step: Option<String>,
    pub saved_at: String,
}

#[derive(Debug, Clone)]
pub struct MigrationStorage {
    pool: SqlitePool,
}

impl MigrationStorage {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let uri = normalize_sqlite_uri(&config.sqlite_path);
        let options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {}", uri))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }
        info!("cloudhop sqlite schema ready");
        Ok(())
    }

    /// Registers a queued run. A caller-chosen id is kept; otherwise one is minted.
    pub async fn create_run(
        &self,
        request: &MigrationRequest,
        run_id: Option<&str>,
    ) -> Result<RunRecord> {
        let now = Utc::now().to_rfc3339();
        let run_id = run_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let request_json = serde_json::to_string(request).context("serialize migration request")?;

        sqlx::query(
            "INSERT INTO migration_runs(run_id, instance_name, tenant_name, status, request_json, submitted_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run_id)
        .bind(&request.name)
        .bind(&request.tenant_name)
        .bind(RunStatus::Queued.as_str())
        .bind(&request_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert run {run_id}"))?;

        self.get_run(&run_id)
            .await?
            .context("run missing after insert")
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        sqlx::query_as::<_, RunRecord>(
            "SELECT run_id, instance_name, tenant_name, status, request_json, submitted_at, updated_at, failure_reason FROM migration_runs WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query run {run_id}"))
    }

    pub async fn list_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        sqlx::query_as::<_, RunRecord>(
            "SELECT run_id, instance_name, tenant_name, status, request_json, submitted_at, updated_at, failure_reason FROM migration_runs ORDER BY submitted_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("query runs")
    }

    pub async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE migration_runs SET status = ?, updated_at = ?, failure_reason = ? WHERE run_id = ?",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(failure_reason)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("update run status for {run_id}"))?;
        Ok(())
    }

    /// Moves a run to `running` unless it already is. Returns false when
    /// another executor holds the run.
    pub async fn claim_run(&self, run_id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE migration_runs SET status = ?, updated_at = ?, failure_reason = NULL WHERE run_id = ? AND status != ?",
        )
        .bind(RunStatus::Running.as_str())
        .bind(now)
        .bind(run_id)
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("claim run {run_id}"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Fails every run left `running` by a process that is gone.
    pub async fn fail_interrupted(&self, reason: &str) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE migration_runs SET status = ?, updated_at = ?, failure_reason = ? WHERE status = ?",
        )
        .bind(RunStatus::Failed.as_str())
        .bind(now)
        .bind(reason)
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .context("fail interrupted runs")?;
        Ok(result.rows_affected())
    }

    /// Replaces the stored snapshot of a run.
    pub async fn save_checkpoint(
        &self,
        run_id: &str,
        state: &WorkflowState,
        completed_steps: &[String],
        last_step: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let state_blob = encode_snapshot(state).context("encode workflow state")?;
        let completed_steps_json =
            serde_json::to_string(completed_steps).context("serialize completed steps")?;

        sqlx::query(
            "INSERT INTO migration_checkpoints(run_id, state_blob, completed_steps_json, last_step, saved_at) VALUES (?, ?, ?, ?, ?) ON CONFLICT(run_id) DO UPDATE SET state_blob = excluded.state_blob, completed_steps_json = excluded.completed_steps_json, last_step = excluded.last_step, saved_at = excluded.saved_at",
        )
        .bind(run_id)
        .bind(state_blob)
        .bind(completed_steps_json)
        .bind(last_step)
        .bind(&now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("save checkpoint for {run_id}"))?;

        sqlx::query("UPDATE migration_runs SET updated_at = ? WHERE run_id = ?")
            .bind(&now)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("touch run {run_id}"))?;
        Ok(())
    }

    pub async fn load_checkpoint(&self, run_id: &str) -> Result<Option<CheckpointRecord>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT run_id, state_blob, completed_steps_json, last_step, saved_at FROM migration_checkpoints WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query checkpoint {run_id}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state = decode_snapshot(&row.state_blob)
            .with_context(|| format!("decode checkpoint state for {run_id}"))?;
        let completed_steps = serde_json::from_str(&row.completed_steps_json)
            .with_context(|| format!("parse completed steps for {run_id}"))?;
        Ok(Some(CheckpointRecord {
            run_id: row.run_id,
            state,
            completed_steps,
            last_step: row.last_step,
            saved_at: row.saved_at,
        }))
    }

    /// Drops finished runs (and their checkpoints) older than the retention window.
    pub async fn purge_expired(&self, retention_days: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM migration_runs WHERE status IN ('success', 'failed') AND updated_at < datetime('now', '-' || ? || ' days')",
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await
        .context("purge expired runs")?;
        Ok(result.rows_affected())
    }
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
