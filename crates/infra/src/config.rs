//! Configuration loading and representation.
//!
//! Everything is read from `RISKBATCH_*` environment variables; unset
//! variables fall back to the defaults below.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::jobs::types::RetryPolicy;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorConfig {
    /// Identity written into leases.
    pub worker_id: String,
    /// Rows per dispatched chunk
    pub chunk_size: usize,
    /// Concurrent chunk tasks per job
    pub workers_per_job: usize,
    /// Jobs processed concurrently by one orchestrator
    pub max_concurrent_jobs: usize,
    pub lease_ttl: Duration,
    /// How often to poll for claimable jobs
    pub poll_interval: Duration,
    /// Claims allowed before an expiring job is FAILED
    pub max_claim_attempts: u32,
    /// Error-log entries returned by a status query
    pub error_log_cap: usize,
    pub max_rows_per_job: usize,
    /// Retry policy for transient storage errors inside a row
    pub row_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::now_v7()),
            chunk_size: 100,
            workers_per_job: 4,
            max_concurrent_jobs: 2,
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            max_claim_attempts: 3,
            error_log_cap: 100,
            max_rows_per_job: 10_000,
            row_retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_workers_per_job(mut self, workers: usize) -> Self {
        self.workers_per_job = workers;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_row_retry(mut self, policy: RetryPolicy) -> Self {
        self.row_retry = policy;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, jobs: usize) -> Self {
        self.max_concurrent_jobs = jobs;
        self
    }

    /// Lease renewal cadence.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_ttl / 3).max(Duration::from_millis(1))
    }

    /// Reject settings the orchestrator cannot make progress with: a zero
    /// chunk size or an empty pool would stall dispatch forever.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("chunk_size", self.chunk_size as u64)?;
        positive("workers_per_job", self.workers_per_job as u64)?;
        positive("max_concurrent_jobs", self.max_concurrent_jobs as u64)?;
        positive("lease_ttl", self.lease_ttl.as_millis() as u64)?;
        positive("max_claim_attempts", self.max_claim_attempts as u64)?;
        positive("max_rows_per_job", self.max_rows_per_job as u64)?;
        positive("row_retry.max_attempts", self.row_retry.max_attempts as u64)?;
        Ok(())
    }
}

/// Full process configuration for the worker binary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    /// Postgres connection string; `None` runs on in-memory stores.
    pub database_url: Option<String>,
    pub model_manifest: PathBuf,
    pub orchestrator: OrchestratorConfig,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = OrchestratorConfig::default();

        let model_manifest = get("RISKBATCH_MODEL_MANIFEST")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("RISKBATCH_MODEL_MANIFEST"))?;

        let row_retry = RetryPolicy {
            max_attempts: parse_or(&get, "RISKBATCH_ROW_RETRY_ATTEMPTS", defaults.row_retry.max_attempts)?,
            ..defaults.row_retry.clone()
        };

        let orchestrator = OrchestratorConfig {
            worker_id: get("RISKBATCH_WORKER_ID").unwrap_or(defaults.worker_id),
            chunk_size: parse_or(&get, "RISKBATCH_CHUNK_SIZE", defaults.chunk_size)?,
            workers_per_job: parse_or(&get, "RISKBATCH_WORKERS_PER_JOB", defaults.workers_per_job)?,
            max_concurrent_jobs: parse_or(&get, "RISKBATCH_MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?,
            lease_ttl: Duration::from_secs(parse_or(
                &get,
                "RISKBATCH_LEASE_TTL_SECS",
                defaults.lease_ttl.as_secs(),
            )?),
            poll_interval: Duration::from_millis(parse_or(
                &get,
                "RISKBATCH_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            max_claim_attempts: parse_or(&get, "RISKBATCH_MAX_CLAIM_ATTEMPTS", defaults.max_claim_attempts)?,
            error_log_cap: parse_or(&get, "RISKBATCH_ERROR_LOG_CAP", defaults.error_log_cap)?,
            max_rows_per_job: parse_or(&get, "RISKBATCH_MAX_ROWS_PER_JOB", defaults.max_rows_per_job)?,
            row_retry,
        };

        let config = Self {
            database_url: get("DATABASE_URL"),
            model_manifest,
            orchestrator,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Whole seconds from the environment; sub-second leases are for tests.
        positive("RISKBATCH_LEASE_TTL_SECS", self.orchestrator.lease_ttl.as_secs())?;
        self.orchestrator.validate()
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => {
            let parsed = raw.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::Invalid {
                name,
                value: raw,
                reason: e.to_string(),
            })
        }
    }
}

fn positive(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
