//! SQLite-backed pipeline store

use crate::persistence::{
    PipelineRecord, PipelineStore, RunRecord, RunStatus, StepRecord, StepStatus, StepStatusUpdate,
};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// SQLite implementation of the storage port.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and initialize the schema.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create a store at the default per-user data path.
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("conveyor");
        std::fs::create_dir_all(&db_dir)?;

        let db_path = db_dir.join("conveyor.db");
        Self::new(&format!("sqlite:{}?mode=rwc", db_path.display())).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS pipelines (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                schedule TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL REFERENCES pipelines(id),
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                triggered_by TEXT,
                metadata TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_runs_status_started
                ON runs(status, started_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id),
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT,
                result TEXT,
                error TEXT,
                UNIQUE(run_id, name)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id)
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to initialize schema")?;
        }

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn pipeline_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PipelineRecord> {
        Ok(PipelineRecord {
            id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            name: row.get("name"),
            description: row.get("description"),
            schedule: row.get("schedule"),
        })
    }

    fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RunRecord> {
        let metadata: Option<Value> = row
            .get::<Option<String>, _>("metadata")
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("Failed to decode run metadata")?;

        Ok(RunRecord {
            id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            pipeline_id: Uuid::parse_str(&row.get::<String, _>("pipeline_id"))?,
            status: row.get::<String, _>("status").parse()?,
            started_at: Self::from_naive(row.get("started_at")),
            finished_at: row
                .get::<Option<NaiveDateTime>, _>("finished_at")
                .map(Self::from_naive),
            triggered_by: row.get("triggered_by"),
            metadata,
        })
    }

    fn step_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StepRecord> {
        Ok(StepRecord {
            id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            run_id: Uuid::parse_str(&row.get::<String, _>("run_id"))?,
            name: row.get("name"),
            status: row.get::<String, _>("status").parse()?,
            started_at: row
                .get::<Option<NaiveDateTime>, _>("started_at")
                .map(Self::from_naive),
            finished_at: row
                .get::<Option<NaiveDateTime>, _>("finished_at")
                .map(Self::from_naive),
            attempt_count: row.get::<i64, _>("attempt_count") as u32,
            next_retry_at: row
                .get::<Option<NaiveDateTime>, _>("next_retry_at")
                .map(Self::from_naive),
            result: row.get("result"),
            error: row.get("error"),
        })
    }
}

#[async_trait::async_trait]
impl PipelineStore for SqliteStore {
    async fn find_pipeline_by_name(&self, name: &str) -> Result<Option<PipelineRecord>> {
        let row = sqlx::query(
            "SELECT id, name, description, schedule FROM pipelines WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to find pipeline by name")?;

        row.as_ref().map(Self::pipeline_from_row).transpose()
    }

    async fn find_pipeline(&self, id: Uuid) -> Result<Option<PipelineRecord>> {
        let row =
            sqlx::query("SELECT id, name, description, schedule FROM pipelines WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context("Failed to find pipeline")?;

        row.as_ref().map(Self::pipeline_from_row).transpose()
    }

    async fn create_pipeline_if_absent(
        &self,
        name: &str,
        description: Option<&str>,
        schedule: Option<&str>,
    ) -> Result<PipelineRecord> {
        sqlx::query(
            r#"
            INSERT INTO pipelines (id, name, description, schedule)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(description)
        .bind(schedule)
        .execute(&self.pool)
        .await
        .context("Failed to create pipeline")?;

        self.find_pipeline_by_name(name)
            .await?
            .context("Pipeline missing after create")
    }

    async fn create_run(
        &self,
        pipeline_id: Uuid,
        triggered_by: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<RunRecord> {
        let record = RunRecord {
            id: Uuid::new_v4(),
            pipeline_id,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            triggered_by: triggered_by.map(str::to_string),
            metadata,
        };

        sqlx::query(
            r#"
            INSERT INTO runs (id, pipeline_id, status, started_at, triggered_by, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.pipeline_id.to_string())
        .bind(record.status.as_str())
        .bind(Self::to_naive(record.started_at))
        .bind(record.triggered_by.as_deref())
        .bind(record.metadata.as_ref().map(|m| m.to_string()))
        .execute(&self.pool)
        .await
        .context("Failed to create run")?;

        Ok(record)
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET status = ?2, finished_at = COALESCE(?3, finished_at)
            WHERE id = ?1
            "#,
        )
        .bind(run_id.to_string())
        .bind(status.as_str())
        .bind(finished_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .context("Failed to update run status")?;

        Ok(())
    }

    async fn find_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, pipeline_id, status, started_at, finished_at, triggered_by, metadata
            FROM runs
            WHERE id = ?1
            "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to find run")?;

        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn claim_pending_run(&self) -> Result<Option<(RunRecord, PipelineRecord)>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin claim transaction")?;

        let candidate = sqlx::query(
            r#"
            SELECT id FROM runs
            WHERE status = 'pending'
            ORDER BY started_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to select pending run")?;

        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let run_id: String = candidate.get("id");

        // The conditional update re-checks the status inside the same
        // transaction; zero rows affected means a peer won the race.
        let claimed = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'running', started_at = ?2
            WHERE id = ?1 AND status = 'pending'
            "#,
        )
        .bind(&run_id)
        .bind(Self::to_naive(Utc::now()))
        .execute(&mut *tx)
        .await
        .context("Failed to claim run")?;

        if claimed.rows_affected() == 0 {
            return Ok(None);
        }

        let run_row = sqlx::query(
            r#"
            SELECT id, pipeline_id, status, started_at, finished_at, triggered_by, metadata
            FROM runs
            WHERE id = ?1
            "#,
        )
        .bind(&run_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to reload claimed run")?;
        let run = Self::run_from_row(&run_row)?;

        let pipeline_row = sqlx::query(
            "SELECT id, name, description, schedule FROM pipelines WHERE id = ?1",
        )
        .bind(run.pipeline_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .context("Failed to load pipeline for claimed run")?;
        let pipeline = Self::pipeline_from_row(&pipeline_row)?;

        tx.commit()
            .await
            .context("Failed to commit claim transaction")?;

        Ok(Some((run, pipeline)))
    }

    async fn find_stuck_runs(&self, older_than: DateTime<Utc>) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, pipeline_id, status, started_at, finished_at, triggered_by, metadata
            FROM runs
            WHERE status = 'running' AND started_at < ?1
            ORDER BY started_at ASC
            "#,
        )
        .bind(Self::to_naive(older_than))
        .fetch_all(&self.pool)
        .await
        .context("Failed to find stuck runs")?;

        rows.iter().map(Self::run_from_row).collect()
    }

    async fn find_recent_completed(
        &self,
        limit: usize,
        pipeline: Option<&str>,
    ) -> Result<Vec<(RunRecord, PipelineRecord)>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.pipeline_id, r.status, r.started_at, r.finished_at,
                   r.triggered_by, r.metadata,
                   p.id AS p_id, p.name AS p_name,
                   p.description AS p_description, p.schedule AS p_schedule
            FROM runs r
            JOIN pipelines p ON p.id = r.pipeline_id
            WHERE r.status IN ('success', 'failed')
              AND (?1 IS NULL OR p.name = ?1)
            ORDER BY r.finished_at DESC
            LIMIT ?2
            "#,
        )
        .bind(pipeline)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list completed runs")?;

        rows.iter()
            .map(|row| {
                let run = Self::run_from_row(row)?;
                let pipeline = PipelineRecord {
                    id: Uuid::parse_str(&row.get::<String, _>("p_id"))?,
                    name: row.get("p_name"),
                    description: row.get("p_description"),
                    schedule: row.get("p_schedule"),
                };
                Ok((run, pipeline))
            })
            .collect()
    }

    async fn create_step(&self, run_id: Uuid, name: &str) -> Result<StepRecord> {
        sqlx::query(
            r#"
            INSERT INTO steps (id, run_id, name, status, attempt_count)
            VALUES (?1, ?2, ?3, ?4, 0)
            ON CONFLICT(run_id, name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(run_id.to_string())
        .bind(name)
        .bind(StepStatus::Pending.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to create step")?;

        let row = sqlx::query(
            r#"
            SELECT id, run_id, name, status, started_at, finished_at,
                   attempt_count, next_retry_at, result, error
            FROM steps
            WHERE run_id = ?1 AND name = ?2
            "#,
        )
        .bind(run_id.to_string())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .context("Step missing after create")?;

        Self::step_from_row(&row)
    }

    async fn update_step_status(&self, step_id: Uuid, update: StepStatusUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE steps
            SET status = ?2,
                attempt_count = ?3,
                started_at = COALESCE(?4, started_at),
                finished_at = COALESCE(?5, finished_at),
                next_retry_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(step_id.to_string())
        .bind(update.status.as_str())
        .bind(update.attempt_count as i64)
        .bind(update.started_at.map(Self::to_naive))
        .bind(update.finished_at.map(Self::to_naive))
        .bind(update.next_retry_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .context("Failed to update step status")?;

        Ok(())
    }

    async fn update_step_result(
        &self,
        step_id: Uuid,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE steps SET result = ?2, error = ?3 WHERE id = ?1")
            .bind(step_id.to_string())
            .bind(result)
            .bind(error)
            .execute(&self.pool)
            .await
            .context("Failed to update step result")?;

        Ok(())
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, name, status, started_at, finished_at,
                   attempt_count, next_retry_at, result, error
            FROM steps
            WHERE run_id = ?1
            ORDER BY started_at ASC
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list steps")?;

        rows.iter().map(Self::step_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let store = memory_store().await;
        let pipeline = store
            .create_pipeline_if_absent("etl", Some("nightly import"), None)
            .await
            .unwrap();

        let metadata = json!({"tenant": "acme", "ids": [1, 2, null]});
        let run = store
            .create_run(pipeline.id, Some("cli"), Some(metadata.clone()))
            .await
            .unwrap();

        let loaded = store.find_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Pending);
        assert_eq!(loaded.metadata, Some(metadata));
        assert_eq!(loaded.triggered_by.as_deref(), Some("cli"));
    }

    #[tokio::test]
    async fn test_claim_transitions_oldest_pending() {
        let store = memory_store().await;
        let pipeline = store
            .create_pipeline_if_absent("etl", None, None)
            .await
            .unwrap();
        let first = store.create_run(pipeline.id, None, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.create_run(pipeline.id, None, None).await.unwrap();

        let (run, claimed_pipeline) = store.claim_pending_run().await.unwrap().unwrap();
        assert_eq!(run.id, first.id);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(claimed_pipeline.id, pipeline.id);
        // The claim overwrites the submission time.
        assert!(run.started_at >= first.started_at);
    }

    #[tokio::test]
    async fn test_step_updates_in_place() {
        let store = memory_store().await;
        let pipeline = store
            .create_pipeline_if_absent("etl", None, None)
            .await
            .unwrap();
        let run = store.create_run(pipeline.id, None, None).await.unwrap();
        let step = store.create_step(run.id, "fetch").await.unwrap();

        let now = Utc::now();
        store
            .update_step_status(
                step.id,
                StepStatusUpdate {
                    status: StepStatus::Running,
                    started_at: Some(now),
                    attempt_count: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_step_result(step.id, Some("\"Hello\""), None)
            .await
            .unwrap();

        let steps = store.list_steps(run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Running);
        assert_eq!(steps[0].attempt_count, 1);
        assert_eq!(steps[0].result.as_deref(), Some("\"Hello\""));

        // A second create for the same (run, name) returns the same row.
        let again = store.create_step(run.id, "fetch").await.unwrap();
        assert_eq!(again.id, step.id);
        assert_eq!(again.attempt_count, 1);
    }
}
