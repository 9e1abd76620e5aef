//! Postgres-backed store implementations.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Duplicate` | Job or result already recorded |
//! | Database (other) | Any other | `Backend` | Constraint/connection problems |
//! | RowNotFound / pool errors | N/A | `Backend` | Network errors, closed pool, etc. |
//!
//! ## Concurrency
//!
//! The claim uses a single conditional `UPDATE ... WHERE status = 'pending'`,
//! so the row lock serializes concurrent claims and exactly one wins. General
//! transitions run in a transaction with `SELECT ... FOR UPDATE` so the state
//! machine is validated against the row another writer cannot be mutating.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::instrument;

use finsight_core::{ActivityRecord, AnalysisResult, Job, JobId, JobStatus};

use super::activity::{ActivityStore, ActivityTotals};
use super::job::{JobStore, StatusCounts};
use super::result::{clamp_limit, ResultPage, ResultStore};
use super::StoreError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS analysis_jobs (
        job_id        UUID PRIMARY KEY,
        filename      TEXT NOT NULL,
        query         TEXT NOT NULL,
        status        TEXT NOT NULL DEFAULT 'pending',
        created_at    TIMESTAMPTZ NOT NULL,
        updated_at    TIMESTAMPTZ NOT NULL,
        completed_at  TIMESTAMPTZ,
        error_message TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_results (
        job_id          UUID PRIMARY KEY REFERENCES analysis_jobs (job_id),
        filename        TEXT NOT NULL,
        query           TEXT NOT NULL,
        analysis        TEXT NOT NULL,
        processing_time DOUBLE PRECISION NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_activity (
        id            BIGSERIAL PRIMARY KEY,
        job_id        UUID NOT NULL,
        client_origin TEXT,
        file_size     BIGINT,
        query_length  BIGINT NOT NULL,
        success       BOOLEAN NOT NULL,
        recorded_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_analysis_jobs_status ON analysis_jobs (status)",
    "CREATE INDEX IF NOT EXISTS idx_analysis_results_created_at ON analysis_results (created_at DESC)",
];

/// Open a connection pool against `database_url`.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Backend(format!("connect: {e}")))
}

/// Create the three pipeline tables if they do not exist yet.
pub async fn init_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Backend(format!("init_schema: {e}")))?;
    }
    Ok(())
}

fn backend_err(op: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Backend(format!("{op}: {e}"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let decode = backend_err("decode job row");
    let status: String = row.try_get("status").map_err(&decode)?;
    Ok(Job {
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(&decode)?),
        filename: row.try_get("filename").map_err(&decode)?,
        query: row.try_get("query").map_err(&decode)?,
        status: status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Backend(format!("decode job row: {e}")))?,
        created_at: row.try_get("created_at").map_err(&decode)?,
        updated_at: row.try_get("updated_at").map_err(&decode)?,
        completed_at: row.try_get("completed_at").map_err(&decode)?,
        error_message: row.try_get("error_message").map_err(&decode)?,
    })
}

fn result_from_row(row: &PgRow) -> Result<AnalysisResult, StoreError> {
    let decode = backend_err("decode result row");
    Ok(AnalysisResult {
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(&decode)?),
        filename: row.try_get("filename").map_err(&decode)?,
        query: row.try_get("query").map_err(&decode)?,
        analysis: row.try_get("analysis").map_err(&decode)?,
        processing_time: row.try_get("processing_time").map_err(&decode)?,
        created_at: row.try_get("created_at").map_err(&decode)?,
    })
}

const JOB_COLUMNS: &str =
    "job_id, filename, query, status, created_at, updated_at, completed_at, error_message";

/// Postgres job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.job_id), err)]
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO analysis_jobs
                (job_id, filename, query, status, created_at, updated_at, completed_at, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(&job.filename)
        .bind(&job.query)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(job.job_id)
            } else {
                StoreError::Backend(format!("create job: {e}"))
            }
        })?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE job_id = $1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend_err("get job"))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn claim(&self, job_id: JobId) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE analysis_jobs
            SET status = 'processing', updated_at = $2
            WHERE job_id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend_err("claim job"))?;

        match row {
            Some(row) => job_from_row(&row),
            // The conditional update matched nothing: either the job is gone
            // or another claimer got there first.
            None => match self.get(job_id).await? {
                Some(_) => Err(StoreError::Conflict(job_id)),
                None => Err(StoreError::NotFound(job_id)),
            },
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id, next = %next), err)]
    async fn transition(
        &self,
        job_id: JobId,
        next: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(backend_err("begin transition"))?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE job_id = $1 FOR UPDATE"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend_err("lock job"))?;

        let mut job = match row {
            Some(row) => job_from_row(&row)?,
            None => return Err(StoreError::NotFound(job_id)),
        };

        job.transition_to(next, error_message)
            .map_err(|e| StoreError::InvalidTransition {
                job_id,
                detail: e.to_string(),
            })?;

        sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = $2, updated_at = $3, completed_at = $4, error_message = $5
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.updated_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .execute(&mut *tx)
        .await
        .map_err(backend_err("update job"))?;

        tx.commit().await.map_err(backend_err("commit transition"))?;
        Ok(job)
    }

    async fn delete(&self, job_id: JobId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM analysis_jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(backend_err("delete job"))?;
        Ok(())
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM analysis_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(backend_err("job counts"))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let decode = backend_err("decode counts row");
            let status: String = row.try_get("status").map_err(&decode)?;
            let n: i64 = row.try_get("n").map_err(&decode)?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| StoreError::Backend(format!("decode counts row: {e}")))?;
            match status {
                JobStatus::Pending => counts.pending = n as u64,
                JobStatus::Processing => counts.processing = n as u64,
                JobStatus::Completed => counts.completed = n as u64,
                JobStatus::Failed => counts.failed = n as u64,
            }
        }
        Ok(counts)
    }

    async fn stale_processing(&self, older_than: Duration) -> Result<Vec<Job>, StoreError> {
        let cutoff: DateTime<Utc> = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM analysis_jobs
            WHERE status = 'processing' AND updated_at <= $1
            ORDER BY updated_at ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(backend_err("stale processing"))?;

        rows.iter().map(job_from_row).collect()
    }
}

/// Postgres result store. The primary key on `job_id` is the idempotent-write
/// guard against duplicate delivery.
#[derive(Debug, Clone)]
pub struct PostgresResultStore {
    pool: Arc<PgPool>,
}

impl PostgresResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    #[instrument(skip(self, result), fields(job_id = %result.job_id), err)]
    async fn put(&self, result: &AnalysisResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO analysis_results
                (job_id, filename, query, analysis, processing_time, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(result.job_id.as_uuid())
        .bind(&result.filename)
        .bind(&result.query)
        .bind(&result.analysis)
        .bind(result.processing_time)
        .bind(result.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(result.job_id)
            } else {
                StoreError::Backend(format!("put result: {e}"))
            }
        })?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<AnalysisResult>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, filename, query, analysis, processing_time, created_at
            FROM analysis_results WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend_err("get result"))?;

        row.as_ref().map(result_from_row).transpose()
    }

    async fn list(&self, limit: u32, offset: u32) -> Result<ResultPage, StoreError> {
        let limit = clamp_limit(limit);

        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM analysis_results")
            .fetch_one(&*self.pool)
            .await
            .map_err(backend_err("count results"))?
            .try_get("n")
            .map_err(backend_err("decode count"))?;

        let rows = sqlx::query(
            r#"
            SELECT job_id, filename, query, analysis, processing_time, created_at
            FROM analysis_results
            ORDER BY created_at DESC, job_id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(backend_err("list results"))?;

        Ok(ResultPage {
            total: total as u64,
            results: rows.iter().map(result_from_row).collect::<Result<_, _>>()?,
        })
    }

    async fn average_processing_time(&self) -> Result<Option<f64>, StoreError> {
        sqlx::query("SELECT AVG(processing_time) AS avg FROM analysis_results")
            .fetch_one(&*self.pool)
            .await
            .map_err(backend_err("average processing time"))?
            .try_get("avg")
            .map_err(backend_err("decode average"))
    }
}

/// Postgres activity store.
#[derive(Debug, Clone)]
pub struct PostgresActivityStore {
    pool: Arc<PgPool>,
}

impl PostgresActivityStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ActivityStore for PostgresActivityStore {
    async fn record(&self, activity: &ActivityRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_activity
                (job_id, client_origin, file_size, query_length, success, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(activity.job_id.as_uuid())
        .bind(&activity.client_origin)
        .bind(activity.file_size)
        .bind(activity.query_length)
        .bind(activity.success)
        .bind(activity.timestamp)
        .execute(&*self.pool)
        .await
        .map_err(backend_err("record activity"))?;
        Ok(())
    }

    async fn totals(&self) -> Result<ActivityTotals, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COUNT(*) FILTER (WHERE success) AS succeeded FROM user_activity",
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(backend_err("activity totals"))?;

        let decode = backend_err("decode activity totals");
        let total: i64 = row.try_get("total").map_err(&decode)?;
        let succeeded: i64 = row.try_get("succeeded").map_err(&decode)?;
        Ok(ActivityTotals {
            total: total as u64,
            succeeded: succeeded as u64,
        })
    }
}
