//! Postgres-backed job and record stores.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (serialization failure) | `40001` | `Transient` | Concurrent transactions collided |
//! | Database (deadlock detected) | `40P01` | `Transient` | Lock cycle between workers |
//! | Database (unique violation) | `23505` | `Storage` | Handled explicitly where a conflict is expected |
//! | Database (check constraint violation) | `23514` | `Storage` | Counter invariant would break |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolTimedOut / Io | N/A | `Transient` | Pool exhausted, connection dropped |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | ColumnDecode / Decode | N/A | `Corrupt` | Stored row no longer decodes |
//!
//! ## Thread Safety
//!
//! Both stores are `Send + Sync` and cheap to clone; all state lives in the
//! database and every state change is a single conditional statement.

mod jobs;
mod records;

use sqlx::PgPool;
use tracing::info;

use crate::store::StoreError;

pub use jobs::PostgresJobStore;
pub use records::PostgresRecordStore;

/// Idempotent schema for both stores.
///
/// `COALESCE(reporting_quarter, 0)` keys annual predictions, whose quarter is
/// NULL, so that at most one exists per company, year and scope.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS companies (
    id UUID PRIMARY KEY,
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    sector TEXT,
    scope_key TEXT NOT NULL,
    organization_id UUID,
    created_by UUID NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT companies_symbol_scope_key UNIQUE (symbol, scope_key)
);

CREATE TABLE IF NOT EXISTS predictions (
    id UUID PRIMARY KEY,
    company_id UUID NOT NULL REFERENCES companies (id),
    scope_key TEXT NOT NULL,
    organization_id UUID,
    reporting_year INTEGER NOT NULL,
    reporting_quarter SMALLINT CHECK (reporting_quarter BETWEEN 1 AND 4),
    ratios JSONB NOT NULL,
    probability DOUBLE PRECISION NOT NULL CHECK (probability BETWEEN 0 AND 1),
    risk_tier TEXT NOT NULL,
    confidence DOUBLE PRECISION NOT NULL,
    members JSONB NOT NULL,
    created_by UUID NOT NULL,
    source_job_id UUID,
    source_row_index INTEGER,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE UNIQUE INDEX IF NOT EXISTS predictions_key
    ON predictions (company_id, reporting_year, (COALESCE(reporting_quarter, 0)), scope_key);
CREATE INDEX IF NOT EXISTS predictions_source_job ON predictions (source_job_id);
CREATE INDEX IF NOT EXISTS predictions_scope_created ON predictions (scope_key, created_at DESC);

CREATE TABLE IF NOT EXISTS prediction_jobs (
    id UUID PRIMARY KEY,
    kind TEXT NOT NULL,
    owner_id UUID NOT NULL,
    organization_id UUID,
    scope_key TEXT NOT NULL,
    status TEXT NOT NULL,
    total_rows INTEGER NOT NULL CHECK (total_rows > 0),
    processed_rows INTEGER NOT NULL DEFAULT 0,
    successful_rows INTEGER NOT NULL DEFAULT 0,
    failed_rows INTEGER NOT NULL DEFAULT 0,
    payload JSONB NOT NULL,
    lease_owner TEXT,
    lease_expires_at TIMESTAMPTZ,
    claim_attempts INTEGER NOT NULL DEFAULT 0,
    failure_reason TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    CONSTRAINT prediction_jobs_counters CHECK (
        processed_rows = successful_rows + failed_rows AND processed_rows <= total_rows
    )
);

CREATE INDEX IF NOT EXISTS prediction_jobs_claimable ON prediction_jobs (status, created_at);

CREATE TABLE IF NOT EXISTS prediction_job_rows (
    job_id UUID NOT NULL REFERENCES prediction_jobs (id) ON DELETE CASCADE,
    row_index INTEGER NOT NULL CHECK (row_index >= 0),
    error_kind TEXT,
    error_message TEXT,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (job_id, row_index)
);
"#;

/// Create tables and indexes if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    info!("database schema ready");
    Ok(())
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => StoreError::Transient(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Transient(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Transient(format!("io error in {}: {}", operation, e)),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("undecodable row in {}: {}", operation, err))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Counters are `INTEGER` columns.
pub(crate) fn to_i32(value: usize, what: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Storage(format!("{what} {value} does not fit the schema")))
}

pub(crate) fn to_usize(value: i32, what: &str) -> Result<usize, StoreError> {
    usize::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {what}: {value}")))
}
