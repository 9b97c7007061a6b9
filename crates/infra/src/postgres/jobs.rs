//! Postgres job store.
//!
//! ## Claiming
//!
//! `claim_next` is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP
//! LOCKED)`, so concurrent workers never claim the same job and never block
//! on each other. Lease times come from the database clock.
//!
//! ## Recording
//!
//! A row outcome is inserted into `prediction_job_rows` and the job counters
//! are bumped in the same statement; the primary key on `(job_id, row_index)`
//! makes a repeated record a no-op.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use riskbatch_auth::ReadFilter;
use riskbatch_core::{OrganizationId, UserId};

use super::{map_sqlx_error, to_i32, to_usize};
use crate::jobs::store::JobStore;
use crate::jobs::types::{Job, JobId, JobProgress, JobStatus, Lease, NewJob, RowError, RowRecord};
use crate::store::StoreError;

const JOB_COLUMNS: &str = r#"
    id, kind, owner_id, organization_id, scope_key, status,
    total_rows, processed_rows, successful_rows, failed_rows,
    lease_owner, lease_expires_at, claim_attempts, failure_reason,
    created_at, started_at, completed_at
"#;

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

    async fn status_of(&self, job_id: JobId) -> Result<JobStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM prediction_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_status", e))?
            .ok_or(StoreError::NotFound)?;
        let status: String = row.try_get("status").map_err(|e| map_sqlx_error("job_status", e))?;
        parse_status(&status)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new_job), fields(kind = %new_job.kind, total_rows = new_job.total_rows), err)]
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let (job, payload) = new_job.into_job(JobId::new(), Utc::now());
        sqlx::query(
            r#"
            INSERT INTO prediction_jobs (
                id, kind, owner_id, organization_id, scope_key, status, total_rows, payload, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.kind.as_str())
        .bind(job.owner_id.as_uuid())
        .bind(job.organization_id.map(|o| *o.as_uuid()))
        .bind(job.scope.key())
        .bind(job.status.as_str())
        .bind(to_i32(job.total_rows, "total_rows")?)
        .bind(&payload)
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_job", e))?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM prediction_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(|r| decode_job("get_job", &r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn payload(&self, job_id: JobId) -> Result<serde_json::Value, StoreError> {
        let row = sqlx::query("SELECT payload FROM prediction_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_payload", e))?
            .ok_or(StoreError::NotFound)?;
        row.try_get("payload").map_err(|e| map_sqlx_error("job_payload", e))
    }

    #[instrument(skip(self), err)]
    async fn fail_abandoned(&self, max_claim_attempts: u32) -> Result<Vec<JobId>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE prediction_jobs
            SET status = 'failed',
                failure_reason = 'lease expired after ' || claim_attempts || ' claim attempts',
                lease_owner = NULL,
                lease_expires_at = NULL,
                completed_at = NOW()
            WHERE status = 'processing'
              AND lease_expires_at <= NOW()
              AND claim_attempts >= $1
            RETURNING id
            "#,
        )
        .bind(max_claim_attempts as i32)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_abandoned", e))?;

        rows.iter()
            .map(|r| {
                r.try_get::<uuid::Uuid, _>("id")
                    .map(JobId::from_uuid)
                    .map_err(|e| map_sqlx_error("fail_abandoned", e))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(
        &self,
        worker: &str,
        lease_ttl: Duration,
        max_claim_attempts: u32,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE prediction_jobs
            SET status = 'processing',
                lease_owner = $1,
                lease_expires_at = NOW() + make_interval(secs => $2),
                claim_attempts = claim_attempts + 1,
                started_at = COALESCE(started_at, NOW())
            WHERE id = (
                SELECT id
                FROM prediction_jobs
                WHERE claim_attempts < $3
                  AND (
                    status = 'pending'
                    OR (status = 'processing' AND (lease_expires_at IS NULL OR lease_expires_at <= NOW()))
                  )
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker)
        .bind(lease_ttl.as_secs_f64())
        .bind(max_claim_attempts as i32)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;
        row.map(|r| decode_job("claim_next", &r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn renew_lease(&self, job_id: JobId, worker: &str, lease_ttl: Duration) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE prediction_jobs
            SET lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND status = 'processing' AND lease_owner = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker)
        .bind(lease_ttl.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_lease", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn release_lease(&self, job_id: JobId, worker: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE prediction_jobs
            SET lease_expires_at = NOW(),
                claim_attempts = GREATEST(claim_attempts - 1, 0)
            WHERE id = $1 AND status = 'processing' AND lease_owner = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_lease", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn expire_lease(&self, job_id: JobId, worker: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE prediction_jobs
            SET lease_expires_at = NOW()
            WHERE id = $1 AND status = 'processing' AND lease_owner = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expire_lease", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn recorded_rows(&self, job_id: JobId) -> Result<Vec<usize>, StoreError> {
        let rows = sqlx::query(
            "SELECT row_index FROM prediction_job_rows WHERE job_id = $1 ORDER BY row_index",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recorded_rows", e))?;

        rows.iter()
            .map(|r| {
                let index: i32 = r.try_get("row_index").map_err(|e| map_sqlx_error("recorded_rows", e))?;
                to_usize(index, "row index")
            })
            .collect()
    }

    #[instrument(skip(self, record), fields(row_index = record.row_index()), err)]
    async fn record_row(&self, job_id: JobId, record: RowRecord) -> Result<bool, StoreError> {
        let row_index = record.row_index();
        let total: i32 = sqlx::query("SELECT total_rows FROM prediction_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_row", e))?
            .ok_or(StoreError::NotFound)?
            .try_get("total_rows")
            .map_err(|e| map_sqlx_error("record_row", e))?;
        if row_index >= to_usize(total, "total_rows")? {
            return Err(StoreError::Storage(format!(
                "row index {row_index} out of range for {total} rows"
            )));
        }

        let (kind, message) = match &record {
            RowRecord::Succeeded { .. } => (None, None),
            RowRecord::Failed(err) => (Some(err.kind.as_str()), Some(err.message.as_str())),
        };
        let bumped = sqlx::query(
            r#"
            WITH recorded AS (
                INSERT INTO prediction_job_rows (job_id, row_index, error_kind, error_message)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (job_id, row_index) DO NOTHING
                RETURNING job_id
            )
            UPDATE prediction_jobs
            SET processed_rows = processed_rows + 1,
                successful_rows = successful_rows + CASE WHEN $3::text IS NULL THEN 1 ELSE 0 END,
                failed_rows = failed_rows + CASE WHEN $3::text IS NULL THEN 0 ELSE 1 END
            WHERE id IN (SELECT job_id FROM recorded)
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(to_i32(row_index, "row index")?)
        .bind(kind)
        .bind(message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_row", e))?;
        Ok(bumped.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn try_complete(&self, job_id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE prediction_jobs
            SET status = 'completed',
                completed_at = NOW(),
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status = 'processing' AND processed_rows = total_rows
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_complete", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn fail(&self, job_id: JobId, reason: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE prediction_jobs
            SET status = 'failed',
                failure_reason = $2,
                completed_at = NOW(),
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_job", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, job_id: JobId) -> Result<JobStatus, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE prediction_jobs
            SET status = 'cancelled',
                completed_at = NOW(),
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel_job", e))?;
        if result.rows_affected() == 1 {
            return Ok(JobStatus::Cancelled);
        }
        self.status_of(job_id).await
    }

    #[instrument(skip(self), err)]
    async fn progress(&self, job_id: JobId, error_cap: usize) -> Result<Option<JobProgress>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("progress", e))?;

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM prediction_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("progress", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let job = decode_job("progress", &row)?;

        // One extra row tells whether the log was truncated.
        let errors = sqlx::query(
            r#"
            SELECT row_index, error_kind, error_message
            FROM prediction_job_rows
            WHERE job_id = $1 AND error_kind IS NOT NULL
            ORDER BY row_index
            LIMIT $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(i64::try_from(error_cap).unwrap_or(i64::MAX - 1) + 1)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("progress", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let mut error_log = errors
            .iter()
            .map(decode_row_error)
            .collect::<Result<Vec<_>, _>>()?;
        let truncated = error_log.len() > error_cap;
        error_log.truncate(error_cap);
        Ok(Some(JobProgress::from_job(&job, error_log, truncated)))
    }

    #[instrument(skip(self, filter), err)]
    async fn list(&self, filter: &ReadFilter, limit: usize) -> Result<Vec<Job>, StoreError> {
        let (unrestricted, user_id, organization_id) = match filter {
            ReadFilter::Unrestricted => (true, None, None),
            ReadFilter::Restricted {
                user_id,
                organization_id,
            } => (false, Some(*user_id.as_uuid()), organization_id.map(|o| *o.as_uuid())),
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM prediction_jobs
            WHERE $1 OR owner_id = $2 OR (organization_id IS NOT NULL AND organization_id = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#
        ))
        .bind(unrestricted)
        .bind(user_id)
        .bind(organization_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(|r| decode_job("list_jobs", r)).collect()
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("bad job status '{raw}': {e}")))
}

fn decode_row_error(row: &sqlx::postgres::PgRow) -> Result<RowError, StoreError> {
    let decode = |e| map_sqlx_error("progress", e);
    let index: i32 = row.try_get("row_index").map_err(decode)?;
    let kind: String = row.try_get("error_kind").map_err(decode)?;
    Ok(RowError {
        row_index: to_usize(index, "row index")?,
        kind: kind
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("bad row error kind '{kind}': {e}")))?,
        message: row
            .try_get::<Option<String>, _>("error_message")
            .map_err(decode)?
            .unwrap_or_default(),
    })
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    kind: String,
    owner_id: uuid::Uuid,
    organization_id: Option<uuid::Uuid>,
    scope_key: String,
    status: String,
    total_rows: i32,
    processed_rows: i32,
    successful_rows: i32,
    failed_rows: i32,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    claim_attempts: i32,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            owner_id: row.try_get("owner_id")?,
            organization_id: row.try_get("organization_id")?,
            scope_key: row.try_get("scope_key")?,
            status: row.try_get("status")?,
            total_rows: row.try_get("total_rows")?,
            processed_rows: row.try_get("processed_rows")?,
            successful_rows: row.try_get("successful_rows")?,
            failed_rows: row.try_get("failed_rows")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            claim_attempts: row.try_get("claim_attempts")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let scope = riskbatch_core::Scope::from_key(&row.scope_key)
            .map_err(|e| StoreError::Corrupt(format!("job {}: bad scope key: {e}", row.id)))?;
        let kind = row
            .kind
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("job {}: bad kind: {e}", row.id)))?;
        let lease = match (row.lease_owner, row.lease_expires_at) {
            (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
            _ => None,
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            kind,
            owner_id: UserId::from_uuid(row.owner_id),
            organization_id: row.organization_id.map(OrganizationId::from_uuid),
            scope,
            status: parse_status(&row.status)?,
            total_rows: to_usize(row.total_rows, "total_rows")?,
            processed_rows: to_usize(row.processed_rows, "processed_rows")?,
            successful_rows: to_usize(row.successful_rows, "successful_rows")?,
            failed_rows: to_usize(row.failed_rows, "failed_rows")?,
            lease,
            claim_attempts: u32::try_from(row.claim_attempts)
                .map_err(|_| StoreError::Corrupt(format!("negative claim_attempts: {}", row.claim_attempts)))?,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn decode_job(operation: &str, row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error(operation, e))?
        .try_into()
}
