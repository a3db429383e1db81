//! SQLite storage for the inspection service.
//!
//! Persists clusters, the check catalog, agents, runs (with their plan
//! snapshots), results, and the audit log. The run row is the single
//! source of truth for run status; workers re-read it rather than trusting
//! in-memory state.

use chrono::{DateTime, Utc};
use inspect_core::{
    AgentRunStatus, CheckStatus, ClusterConfig, ExecutorKind, Id, InspectionAgent, InspectionItem,
    InspectionResult, InspectionRun, PlanItem, RunStatus, StatusCounts,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

/// Explicit column list for run queries. Explicit columns instead of
/// SELECT * keep the mapping correct regardless of column order after
/// ALTER TABLE migrations.
const RUNS_COLUMNS: &str = "id, cluster_id, operator, status, executor, agent_id, agent_status, \
    total_items, processed_items, plan_json, summary, report_path, generation, \
    created_at, completed_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),
    #[error("inspection item not found: {0}")]
    ItemNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("run {0} was superseded by a newer worker")]
    RunSuperseded(String),
    #[error("invalid stored value in {column}: {value}")]
    InvalidValue { column: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

fn invalid(column: &'static str, value: &str) -> StorageError {
    StorageError::InvalidValue {
        column,
        value: value.to_string(),
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (creating if needed) the database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // Enable WAL mode
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations, statement by statement, tolerating the
    /// idempotent duplicate-column/table-exists errors from re-runs.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Cluster operations ---

    pub async fn insert_cluster(&self, cluster: &ClusterConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clusters (id, name, kubeconfig_path, prometheus_url, contexts_json,
                                  execution_mode, default_agent_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(cluster.id.as_ref())
        .bind(&cluster.name)
        .bind(&cluster.kubeconfig_path)
        .bind(&cluster.prometheus_url)
        .bind(serde_json::to_string(&cluster.contexts)?)
        .bind(cluster.execution_mode.as_str())
        .bind(cluster.default_agent_id.as_ref().map(Id::as_ref))
        .bind(millis(cluster.created_at))
        .bind(millis(cluster.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_cluster(&self, id: &Id) -> Result<ClusterConfig> {
        let row = sqlx::query_as::<_, ClusterRow>("SELECT * FROM clusters WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::ClusterNotFound(id.to_string()))?;
        row.into_cluster()
    }

    pub async fn get_cluster_by_name(&self, name: &str) -> Result<Option<ClusterConfig>> {
        let row = sqlx::query_as::<_, ClusterRow>("SELECT * FROM clusters WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ClusterRow::into_cluster).transpose()
    }

    pub async fn list_clusters(&self) -> Result<Vec<ClusterConfig>> {
        let rows = sqlx::query_as::<_, ClusterRow>("SELECT * FROM clusters ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ClusterRow::into_cluster).collect()
    }

    pub async fn update_cluster(&self, cluster: &ClusterConfig) -> Result<()> {
        let result = sqlx::query(
            "UPDATE clusters SET name = ?1, kubeconfig_path = ?2, prometheus_url = ?3, \
             contexts_json = ?4, execution_mode = ?5, default_agent_id = ?6, updated_at = ?7 \
             WHERE id = ?8",
        )
        .bind(&cluster.name)
        .bind(&cluster.kubeconfig_path)
        .bind(&cluster.prometheus_url)
        .bind(serde_json::to_string(&cluster.contexts)?)
        .bind(cluster.execution_mode.as_str())
        .bind(cluster.default_agent_id.as_ref().map(Id::as_ref))
        .bind(millis(Utc::now()))
        .bind(cluster.id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ClusterNotFound(cluster.id.to_string()));
        }
        Ok(())
    }

    /// Delete a cluster with its runs and their results; bound agents are
    /// detached rather than deleted.
    pub async fn delete_cluster(&self, id: &Id) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM inspection_results WHERE run_id IN \
             (SELECT id FROM inspection_runs WHERE cluster_id = ?1)",
        )
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM inspection_runs WHERE cluster_id = ?1")
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE inspection_agents SET cluster_id = NULL WHERE cluster_id = ?1")
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ClusterNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Inspection item operations ---

    pub async fn insert_item(&self, item: &InspectionItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inspection_items (id, name, description, check_json, is_archived,
                                          created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(item.id.as_ref())
        .bind(&item.name)
        .bind(&item.description)
        .bind(serde_json::to_string(&item.check)?)
        .bind(i64::from(item.is_archived))
        .bind(millis(item.created_at))
        .bind(millis(item.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_item(&self, id: &Id) -> Result<InspectionItem> {
        let row = sqlx::query_as::<_, ItemRow>("SELECT * FROM inspection_items WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::ItemNotFound(id.to_string()))?;
        row.into_item()
    }

    pub async fn get_item_by_name(&self, name: &str) -> Result<Option<InspectionItem>> {
        let row = sqlx::query_as::<_, ItemRow>("SELECT * FROM inspection_items WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ItemRow::into_item).transpose()
    }

    pub async fn list_items(&self, include_archived: bool) -> Result<Vec<InspectionItem>> {
        let sql = if include_archived {
            "SELECT * FROM inspection_items ORDER BY created_at"
        } else {
            "SELECT * FROM inspection_items WHERE is_archived = 0 ORDER BY created_at"
        };
        let rows = sqlx::query_as::<_, ItemRow>(sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    /// Fetch items by id, preserving the requested order and dropping
    /// duplicate ids. Missing ids are silently absent; the caller compares
    /// counts to detect them.
    pub async fn get_items_by_ids(&self, ids: &[Id]) -> Result<Vec<InspectionItem>> {
        let mut seen = std::collections::HashSet::new();
        let mut items = Vec::new();
        for id in ids {
            if !seen.insert(id.as_ref()) {
                continue;
            }
            let row =
                sqlx::query_as::<_, ItemRow>("SELECT * FROM inspection_items WHERE id = ?1")
                    .bind(id.as_ref())
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some(row) = row {
                items.push(row.into_item()?);
            }
        }
        Ok(items)
    }

    pub async fn update_item(&self, item: &InspectionItem) -> Result<()> {
        let result = sqlx::query(
            "UPDATE inspection_items SET name = ?1, description = ?2, check_json = ?3, \
             is_archived = ?4, updated_at = ?5 WHERE id = ?6",
        )
        .bind(&item.name)
        .bind(&item.description)
        .bind(serde_json::to_string(&item.check)?)
        .bind(i64::from(item.is_archived))
        .bind(millis(Utc::now()))
        .bind(item.id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ItemNotFound(item.id.to_string()));
        }
        Ok(())
    }

    /// Delete a catalog item. Historical results keep their cached item
    /// name; only the foreign reference is nulled.
    pub async fn delete_item(&self, id: &Id) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE inspection_results SET item_id = NULL WHERE item_id = ?1")
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM inspection_items WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ItemNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Agent operations ---

    pub async fn insert_agent(&self, agent: &InspectionAgent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inspection_agents (id, name, token, cluster_id, description, is_enabled,
                                           last_seen_at, prometheus_url, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(agent.id.as_ref())
        .bind(&agent.name)
        .bind(&agent.token)
        .bind(agent.cluster_id.as_ref().map(Id::as_ref))
        .bind(&agent.description)
        .bind(i64::from(agent.is_enabled))
        .bind(agent.last_seen_at.map(millis))
        .bind(&agent.prometheus_url)
        .bind(millis(agent.created_at))
        .bind(millis(agent.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, id: &Id) -> Result<InspectionAgent> {
        let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM inspection_agents WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::AgentNotFound(id.to_string()))?;
        Ok(row.into_agent())
    }

    /// Exact-match token lookup for bearer auth.
    pub async fn get_agent_by_token(&self, token: &str) -> Result<Option<InspectionAgent>> {
        let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM inspection_agents WHERE token = ?1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(AgentRow::into_agent))
    }

    pub async fn list_agents(&self) -> Result<Vec<InspectionAgent>> {
        let rows = sqlx::query_as::<_, AgentRow>("SELECT * FROM inspection_agents ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(AgentRow::into_agent).collect())
    }

    pub async fn touch_agent_seen(&self, id: &Id, seen_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE inspection_agents SET last_seen_at = ?1, updated_at = ?1 WHERE id = ?2",
        )
        .bind(millis(seen_at))
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_agent_enabled(&self, id: &Id, enabled: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE inspection_agents SET is_enabled = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(i64::from(enabled))
        .bind(millis(Utc::now()))
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn delete_agent(&self, id: &Id) -> Result<()> {
        let result = sqlx::query("DELETE FROM inspection_agents WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Run operations ---

    pub async fn insert_run(&self, run: &InspectionRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inspection_runs (id, cluster_id, operator, status, executor, agent_id,
                                         agent_status, total_items, processed_items, plan_json,
                                         summary, report_path, generation, created_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(run.cluster_id.as_ref())
        .bind(&run.operator)
        .bind(run.status.as_str())
        .bind(run.executor.as_str())
        .bind(run.agent_id.as_ref().map(Id::as_ref))
        .bind(run.agent_status.map(|s| s.as_str()))
        .bind(i64::from(run.total_items))
        .bind(i64::from(run.processed_items))
        .bind(serde_json::to_string(&run.plan)?)
        .bind(&run.summary)
        .bind(&run.report_path)
        .bind(run.generation)
        .bind(millis(run.created_at))
        .bind(run.completed_at.map(millis))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &Id) -> Result<InspectionRun> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM inspection_runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        row.into_run()
    }

    pub async fn list_runs(&self) -> Result<Vec<InspectionRun>> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM inspection_runs ORDER BY created_at DESC");
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Server-executed runs that should be (re)submitted after a restart.
    pub async fn list_server_runs_to_recover(&self) -> Result<Vec<InspectionRun>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM inspection_runs \
             WHERE executor = 'server' AND status IN ('queued', 'running', 'paused') \
             ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Queued work for an agent, oldest first.
    pub async fn list_agent_queued_runs(
        &self,
        agent_id: &Id,
        limit: u32,
    ) -> Result<Vec<InspectionRun>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM inspection_runs \
             WHERE agent_id = ?1 AND agent_status = 'queued' \
             ORDER BY created_at ASC LIMIT ?2"
        );
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .bind(agent_id.as_ref())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Set run status (and, for agent runs, the agent sub-state) together
    /// so the two can never imply contradictory progress.
    pub async fn update_run_status(
        &self,
        id: &Id,
        status: RunStatus,
        agent_status: Option<AgentRunStatus>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE inspection_runs SET status = ?1, \
             agent_status = COALESCE(?2, agent_status) WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(agent_status.map(|s| s.as_str()))
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Conditional status transition: only applies when the run is
    /// currently in one of `from`. Returns whether the write landed, so a
    /// control call racing the worker's own terminal write loses cleanly.
    pub async fn transition_run_status(
        &self,
        id: &Id,
        from: &[RunStatus],
        to: RunStatus,
    ) -> Result<bool> {
        let current = self.get_run(id).await?.status;
        if !from.contains(&current) {
            return Ok(false);
        }
        let placeholders = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "UPDATE inspection_runs SET status = ?1 WHERE id = ?2 AND status IN ({placeholders})"
        );
        let result = sqlx::query(&query)
            .bind(to.as_str())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Bump the run's generation for a new worker attempt and return the
    /// fencing value that attempt must present on every write.
    pub async fn begin_run_attempt(&self, id: &Id) -> Result<i64> {
        let generation: Option<i64> = sqlx::query_scalar(
            "UPDATE inspection_runs SET generation = generation + 1 WHERE id = ?1 \
             RETURNING generation",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?;
        generation.ok_or_else(|| StorageError::RunNotFound(id.to_string()))
    }

    /// Atomically claim a queued agent run. Returns false when the run is
    /// not currently claimable (already running or terminal).
    pub async fn claim_agent_run(&self, run_id: &Id, agent_id: &Id) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE inspection_runs SET status = 'running', agent_status = 'running' \
             WHERE id = ?1 AND agent_id = ?2 AND status = 'queued' AND agent_status = 'queued'",
        )
        .bind(run_id.as_ref())
        .bind(agent_id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Advance the progress checkpoint. Monotonic: a write that would move
    /// progress backwards, or that carries a stale generation, is rejected.
    pub async fn advance_progress(&self, id: &Id, processed: u32, generation: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE inspection_runs SET processed_items = MIN(?1, total_items) \
             WHERE id = ?2 AND generation = ?3 AND processed_items <= ?1",
        )
        .bind(i64::from(processed))
        .bind(id.as_ref())
        .bind(generation)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RunSuperseded(id.to_string()));
        }
        Ok(())
    }

    /// Raise the progress checkpoint without a fencing generation (agent
    /// submissions). Still monotonic and clamped.
    pub async fn raise_progress(&self, id: &Id, processed: u32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE inspection_runs \
             SET processed_items = MIN(MAX(processed_items, ?1), total_items) WHERE id = ?2",
        )
        .bind(i64::from(processed))
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Persist one result row from a local worker. Fenced by generation and
    /// refused once the run is terminal, so a cancelled run takes no
    /// further writes.
    pub async fn record_result(
        &self,
        result: &InspectionResult,
        position: u32,
        generation: i64,
    ) -> Result<()> {
        let outcome = sqlx::query(
            r#"
            INSERT INTO inspection_results (id, run_id, item_id, item_name, status, detail,
                                            suggestion, position)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
            WHERE EXISTS (
                SELECT 1 FROM inspection_runs
                WHERE id = ?2 AND generation = ?9
                  AND status NOT IN ('cancelled', 'finished', 'failed')
            )
            "#,
        )
        .bind(result.id.as_ref())
        .bind(result.run_id.as_ref())
        .bind(result.item_id.as_ref().map(Id::as_ref))
        .bind(&result.item_name)
        .bind(result.status.as_str())
        .bind(&result.detail)
        .bind(&result.suggestion)
        .bind(i64::from(position))
        .bind(generation)
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            return Err(StorageError::RunSuperseded(result.run_id.to_string()));
        }
        Ok(())
    }

    /// Replace the full result set for a run (agent resubmission semantics).
    pub async fn replace_results(&self, run_id: &Id, results: &[InspectionResult]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM inspection_results WHERE run_id = ?1")
            .bind(run_id.as_ref())
            .execute(&mut *tx)
            .await?;
        for (position, result) in results.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO inspection_results (id, run_id, item_id, item_name, status, detail,
                                                suggestion, position)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(result.id.as_ref())
            .bind(run_id.as_ref())
            .bind(result.item_id.as_ref().map(Id::as_ref))
            .bind(&result.item_name)
            .bind(result.status.as_str())
            .bind(&result.detail)
            .bind(&result.suggestion)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Results for a run, in plan order.
    pub async fn list_results(&self, run_id: &Id) -> Result<Vec<InspectionResult>> {
        let rows = sqlx::query_as::<_, ResultRow>(
            "SELECT * FROM inspection_results WHERE run_id = ?1 ORDER BY position ASC",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ResultRow::into_result).collect()
    }

    /// Per-status result counts for a run.
    pub async fn count_result_statuses(&self, run_id: &Id) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM inspection_results WHERE run_id = ?1 GROUP BY status",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let status =
                CheckStatus::parse(&status).ok_or_else(|| invalid("status", &status))?;
            for _ in 0..count {
                counts.add(status);
            }
        }
        Ok(counts)
    }

    /// Terminal transition: status, summary, completion time in one write.
    /// A cancelled run is never overwritten; that write quietly loses.
    pub async fn finalize_run(
        &self,
        id: &Id,
        status: RunStatus,
        agent_status: Option<AgentRunStatus>,
        summary: &str,
    ) -> Result<()> {
        self.get_run(id).await?;
        sqlx::query(
            "UPDATE inspection_runs SET status = ?1, agent_status = COALESCE(?2, agent_status), \
             summary = ?3, completed_at = ?4 WHERE id = ?5 AND status != 'cancelled'",
        )
        .bind(status.as_str())
        .bind(agent_status.map(|s| s.as_str()))
        .bind(summary)
        .bind(millis(Utc::now()))
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reclaim running agent runs whose agent missed its heartbeat
    /// deadline: back to queued on both state machines, completion time
    /// cleared, a note appended to the summary. Returns the number of runs
    /// reset.
    pub async fn reset_stale_agent_runs(
        &self,
        cutoff: DateTime<Utc>,
        note: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE inspection_runs
            SET status = 'queued', agent_status = 'queued', completed_at = NULL,
                summary = CASE
                    WHEN summary IS NULL OR summary = '' THEN ?1
                    ELSE summary || ' ' || ?1
                END
            WHERE executor = 'agent' AND status = 'running' AND agent_status = 'running'
              AND agent_id IN (
                  SELECT id FROM inspection_agents
                  WHERE last_seen_at IS NOT NULL AND last_seen_at < ?2
              )
            "#,
        )
        .bind(note)
        .bind(millis(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_run(&self, id: &Id) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM inspection_results WHERE run_id = ?1")
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM inspection_runs WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Audit log ---

    pub async fn append_audit(
        &self,
        action: &str,
        entity_type: &str,
        entity_id: Option<&Id>,
        description: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_logs (id, action, entity_type, entity_id, description, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(Id::new().as_ref())
        .bind(action)
        .bind(entity_type)
        .bind(entity_id.map(Id::as_ref))
        .bind(description)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_audit(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT * FROM audit_logs ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AuditRow::into_entry).collect())
    }
}

/// One audit log entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEntry {
    pub id: Id,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<Id>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

// --- Row mapping ---

#[derive(sqlx::FromRow)]
struct ClusterRow {
    id: String,
    name: String,
    kubeconfig_path: String,
    prometheus_url: Option<String>,
    contexts_json: Option<String>,
    execution_mode: String,
    default_agent_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl ClusterRow {
    fn into_cluster(self) -> Result<ClusterConfig> {
        let execution_mode = ExecutorKind::parse(&self.execution_mode)
            .ok_or_else(|| invalid("execution_mode", &self.execution_mode))?;
        let contexts = match self.contexts_json.as_deref() {
            Some(json) if !json.is_empty() => serde_json::from_str(json)?,
            _ => Vec::new(),
        };
        Ok(ClusterConfig {
            id: Id::from_string(self.id),
            name: self.name,
            kubeconfig_path: self.kubeconfig_path,
            prometheus_url: self.prometheus_url,
            contexts,
            execution_mode,
            default_agent_id: self.default_agent_id.map(Id::from_string),
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: String,
    name: String,
    description: Option<String>,
    check_json: String,
    is_archived: i64,
    created_at: i64,
    updated_at: i64,
}

impl ItemRow {
    fn into_item(self) -> Result<InspectionItem> {
        Ok(InspectionItem {
            id: Id::from_string(self.id),
            name: self.name,
            description: self.description,
            check: serde_json::from_str(&self.check_json)?,
            is_archived: self.is_archived != 0,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    name: String,
    token: String,
    cluster_id: Option<String>,
    description: Option<String>,
    is_enabled: i64,
    last_seen_at: Option<i64>,
    prometheus_url: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl AgentRow {
    fn into_agent(self) -> InspectionAgent {
        InspectionAgent {
            id: Id::from_string(self.id),
            name: self.name,
            token: self.token,
            cluster_id: self.cluster_id.map(Id::from_string),
            description: self.description,
            is_enabled: self.is_enabled != 0,
            last_seen_at: self.last_seen_at.map(from_millis),
            prometheus_url: self.prometheus_url,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    cluster_id: String,
    operator: Option<String>,
    status: String,
    executor: String,
    agent_id: Option<String>,
    agent_status: Option<String>,
    total_items: i64,
    processed_items: i64,
    plan_json: String,
    summary: Option<String>,
    report_path: Option<String>,
    generation: i64,
    created_at: i64,
    completed_at: Option<i64>,
}

impl RunRow {
    fn into_run(self) -> Result<InspectionRun> {
        let status =
            RunStatus::parse(&self.status).ok_or_else(|| invalid("status", &self.status))?;
        let executor = ExecutorKind::parse(&self.executor)
            .ok_or_else(|| invalid("executor", &self.executor))?;
        let agent_status = match self.agent_status.as_deref() {
            Some(s) => {
                Some(AgentRunStatus::parse(s).ok_or_else(|| invalid("agent_status", s))?)
            }
            None => None,
        };
        // The plan snapshot is decoded once here and never re-derived from
        // the catalog.
        let plan: Vec<PlanItem> = serde_json::from_str(&self.plan_json)?;
        Ok(InspectionRun {
            id: Id::from_string(self.id),
            cluster_id: Id::from_string(self.cluster_id),
            operator: self.operator,
            status,
            executor,
            agent_id: self.agent_id.map(Id::from_string),
            agent_status,
            total_items: self.total_items as u32,
            processed_items: self.processed_items as u32,
            plan,
            summary: self.summary,
            report_path: self.report_path,
            generation: self.generation,
            created_at: from_millis(self.created_at),
            completed_at: self.completed_at.map(from_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    id: String,
    run_id: String,
    item_id: Option<String>,
    item_name: String,
    status: String,
    detail: Option<String>,
    suggestion: Option<String>,
    #[allow(dead_code)]
    position: i64,
}

impl ResultRow {
    fn into_result(self) -> Result<InspectionResult> {
        let status =
            CheckStatus::parse(&self.status).ok_or_else(|| invalid("status", &self.status))?;
        Ok(InspectionResult {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            item_id: self.item_id.map(Id::from_string),
            item_name: self.item_name,
            status,
            detail: self.detail,
            suggestion: self.suggestion,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: String,
    action: String,
    entity_type: String,
    entity_id: Option<String>,
    description: Option<String>,
    created_at: i64,
}

impl AuditRow {
    fn into_entry(self) -> AuditEntry {
        AuditEntry {
            id: Id::from_string(self.id),
            action: self.action,
            entity_type: self.entity_type,
            entity_id: self.entity_id.map(Id::from_string),
            description: self.description,
            created_at: from_millis(self.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inspect_core::CheckSpec;
    use tempfile::TempDir;

    async fn open_test_storage() -> (Storage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        (storage, dir)
    }

    fn test_cluster(name: &str) -> ClusterConfig {
        let now = Utc::now();
        ClusterConfig {
            id: Id::new(),
            name: name.to_string(),
            kubeconfig_path: "/tmp/kubeconfig.yaml".to_string(),
            prometheus_url: None,
            contexts: vec!["default".to_string()],
            execution_mode: ExecutorKind::Server,
            default_agent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_item(name: &str) -> InspectionItem {
        let now = Utc::now();
        InspectionItem {
            id: Id::new(),
            name: name.to_string(),
            description: None,
            check: CheckSpec::ClusterVersion,
            is_archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_run(cluster_id: &Id, plan: Vec<PlanItem>) -> InspectionRun {
        InspectionRun {
            id: Id::new(),
            cluster_id: cluster_id.clone(),
            operator: Some("tester".to_string()),
            status: RunStatus::Queued,
            executor: ExecutorKind::Server,
            agent_id: None,
            agent_status: None,
            total_items: plan.len() as u32,
            processed_items: 0,
            plan,
            summary: None,
            report_path: None,
            generation: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn plan_item(name: &str) -> PlanItem {
        PlanItem {
            item_id: Id::new(),
            name: name.to_string(),
            description: None,
            check: CheckSpec::ClusterVersion,
        }
    }

    #[tokio::test]
    async fn run_plan_round_trips() {
        let (storage, _dir) = open_test_storage().await;
        let cluster = test_cluster("prod");
        storage.insert_cluster(&cluster).await.unwrap();

        let run = test_run(&cluster.id, vec![plan_item("a"), plan_item("b")]);
        storage.insert_run(&run).await.unwrap();

        let loaded = storage.get_run(&run.id).await.unwrap();
        assert_eq!(loaded.plan.len(), 2);
        assert_eq!(loaded.plan[0].name, "a");
        assert_eq!(loaded.total_items, 2);
        assert_eq!(loaded.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn items_by_ids_preserve_order_and_dedup() {
        let (storage, _dir) = open_test_storage().await;
        let item_a = test_item("a");
        let item_b = test_item("b");
        storage.insert_item(&item_a).await.unwrap();
        storage.insert_item(&item_b).await.unwrap();

        let ids = vec![item_b.id.clone(), item_a.id.clone(), item_b.id.clone()];
        let items = storage.get_items_by_ids(&ids).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "b");
        assert_eq!(items[1].name, "a");
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_clamped() {
        let (storage, _dir) = open_test_storage().await;
        let cluster = test_cluster("prod");
        storage.insert_cluster(&cluster).await.unwrap();
        let run = test_run(&cluster.id, vec![plan_item("a"), plan_item("b")]);
        storage.insert_run(&run).await.unwrap();

        let generation = storage.begin_run_attempt(&run.id).await.unwrap();
        storage.advance_progress(&run.id, 1, generation).await.unwrap();

        // Backwards write rejected.
        let err = storage.advance_progress(&run.id, 0, generation).await;
        assert!(matches!(err, Err(StorageError::RunSuperseded(_))));

        // Over-advance clamps to total_items.
        storage.advance_progress(&run.id, 9, generation).await.unwrap();
        let loaded = storage.get_run(&run.id).await.unwrap();
        assert_eq!(loaded.processed_items, 2);
    }

    #[tokio::test]
    async fn stale_generation_writes_are_fenced() {
        let (storage, _dir) = open_test_storage().await;
        let cluster = test_cluster("prod");
        storage.insert_cluster(&cluster).await.unwrap();
        let run = test_run(&cluster.id, vec![plan_item("a")]);
        storage.insert_run(&run).await.unwrap();

        let old_generation = storage.begin_run_attempt(&run.id).await.unwrap();
        let new_generation = storage.begin_run_attempt(&run.id).await.unwrap();
        assert!(new_generation > old_generation);

        let result = InspectionResult {
            id: Id::new(),
            run_id: run.id.clone(),
            item_id: None,
            item_name: "a".to_string(),
            status: CheckStatus::Passed,
            detail: None,
            suggestion: None,
        };
        let err = storage.record_result(&result, 0, old_generation).await;
        assert!(matches!(err, Err(StorageError::RunSuperseded(_))));

        storage.record_result(&result, 0, new_generation).await.unwrap();
        assert_eq!(storage.list_results(&run.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_refuses_result_writes() {
        let (storage, _dir) = open_test_storage().await;
        let cluster = test_cluster("prod");
        storage.insert_cluster(&cluster).await.unwrap();
        let run = test_run(&cluster.id, vec![plan_item("a")]);
        storage.insert_run(&run).await.unwrap();
        let generation = storage.begin_run_attempt(&run.id).await.unwrap();

        storage
            .update_run_status(&run.id, RunStatus::Cancelled, None)
            .await
            .unwrap();

        let result = InspectionResult {
            id: Id::new(),
            run_id: run.id.clone(),
            item_id: None,
            item_name: "a".to_string(),
            status: CheckStatus::Passed,
            detail: None,
            suggestion: None,
        };
        let err = storage.record_result(&result, 0, generation).await;
        assert!(matches!(err, Err(StorageError::RunSuperseded(_))));
        assert!(storage.list_results(&run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_results_has_replace_semantics() {
        let (storage, _dir) = open_test_storage().await;
        let cluster = test_cluster("prod");
        storage.insert_cluster(&cluster).await.unwrap();
        let run = test_run(&cluster.id, vec![plan_item("a")]);
        storage.insert_run(&run).await.unwrap();

        let make_result = |name: &str, status| InspectionResult {
            id: Id::new(),
            run_id: run.id.clone(),
            item_id: None,
            item_name: name.to_string(),
            status,
            detail: None,
            suggestion: None,
        };

        let first = vec![
            make_result("a", CheckStatus::Passed),
            make_result("b", CheckStatus::Warning),
            make_result("c", CheckStatus::Failed),
        ];
        storage.replace_results(&run.id, &first).await.unwrap();
        assert_eq!(storage.list_results(&run.id).await.unwrap().len(), 3);

        let second = vec![make_result("a", CheckStatus::Passed)];
        storage.replace_results(&run.id, &second).await.unwrap();
        let results = storage.list_results(&run.id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item_name, "a");
    }

    #[tokio::test]
    async fn stale_agent_runs_reset_to_queued() {
        let (storage, _dir) = open_test_storage().await;
        let cluster = test_cluster("prod");
        storage.insert_cluster(&cluster).await.unwrap();

        let now = Utc::now();
        let agent = InspectionAgent {
            id: Id::new(),
            name: "edge".to_string(),
            token: "tok".to_string(),
            cluster_id: Some(cluster.id.clone()),
            description: None,
            is_enabled: true,
            last_seen_at: Some(now - chrono::Duration::minutes(10)),
            prometheus_url: None,
            created_at: now,
            updated_at: now,
        };
        storage.insert_agent(&agent).await.unwrap();

        let mut run = test_run(&cluster.id, vec![plan_item("a")]);
        run.executor = ExecutorKind::Agent;
        run.agent_id = Some(agent.id.clone());
        run.agent_status = Some(AgentRunStatus::Running);
        run.status = RunStatus::Running;
        run.processed_items = 1;
        storage.insert_run(&run).await.unwrap();

        let cutoff = now - chrono::Duration::minutes(5);
        let reset = storage
            .reset_stale_agent_runs(cutoff, "Reset after agent heartbeat timeout.")
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let loaded = storage.get_run(&run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Queued);
        assert_eq!(loaded.agent_status, Some(AgentRunStatus::Queued));
        assert!(loaded.completed_at.is_none());
        // Checkpoint survives the reset.
        assert_eq!(loaded.processed_items, 1);
        assert!(loaded.summary.unwrap().contains("heartbeat timeout"));

        // A fresh heartbeat stops further resets.
        storage.touch_agent_seen(&agent.id, Utc::now()).await.unwrap();
        let reset = storage
            .reset_stale_agent_runs(cutoff, "note")
            .await
            .unwrap();
        assert_eq!(reset, 0);
    }

    #[tokio::test]
    async fn agent_queue_is_ordered_and_limited() {
        let (storage, _dir) = open_test_storage().await;
        let cluster = test_cluster("prod");
        storage.insert_cluster(&cluster).await.unwrap();
        let agent_id = Id::new();

        for (offset, name) in [(2i64, "older"), (1, "newer")] {
            let mut run = test_run(&cluster.id, vec![plan_item(name)]);
            run.executor = ExecutorKind::Agent;
            run.agent_id = Some(agent_id.clone());
            run.agent_status = Some(AgentRunStatus::Queued);
            run.created_at = Utc::now() - chrono::Duration::minutes(offset);
            storage.insert_run(&run).await.unwrap();
        }

        let queued = storage.list_agent_queued_runs(&agent_id, 1).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].plan[0].name, "older");
    }

    #[tokio::test]
    async fn delete_item_keeps_cached_result_name() {
        let (storage, _dir) = open_test_storage().await;
        let cluster = test_cluster("prod");
        storage.insert_cluster(&cluster).await.unwrap();
        let item = test_item("check-a");
        storage.insert_item(&item).await.unwrap();

        let run = test_run(&cluster.id, vec![plan_item("check-a")]);
        storage.insert_run(&run).await.unwrap();
        let generation = storage.begin_run_attempt(&run.id).await.unwrap();
        let result = InspectionResult {
            id: Id::new(),
            run_id: run.id.clone(),
            item_id: Some(item.id.clone()),
            item_name: "check-a".to_string(),
            status: CheckStatus::Passed,
            detail: None,
            suggestion: None,
        };
        storage.record_result(&result, 0, generation).await.unwrap();

        storage.delete_item(&item.id).await.unwrap();
        let results = storage.list_results(&run.id).await.unwrap();
        assert_eq!(results[0].item_id, None);
        assert_eq!(results[0].item_name, "check-a");
    }

    #[tokio::test]
    async fn agent_token_lookup_is_exact() {
        let (storage, _dir) = open_test_storage().await;
        let now = Utc::now();
        let agent = InspectionAgent {
            id: Id::new(),
            name: "edge".to_string(),
            token: "secret-token".to_string(),
            cluster_id: None,
            description: None,
            is_enabled: true,
            last_seen_at: None,
            prometheus_url: None,
            created_at: now,
            updated_at: now,
        };
        storage.insert_agent(&agent).await.unwrap();

        assert!(storage
            .get_agent_by_token("secret-token")
            .await
            .unwrap()
            .is_some());
        assert!(storage
            .get_agent_by_token("secret-token ")
            .await
            .unwrap()
            .is_none());
    }
}
