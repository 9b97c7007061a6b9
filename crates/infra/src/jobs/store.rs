//! Job storage implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use riskbatch_auth::ReadFilter;

use super::types::{Job, JobId, JobProgress, JobStatus, Lease, NewJob, RowError, RowRecord};
use crate::store::StoreError;

/// Job store abstraction.
///
/// Every state change is a single conditional update, so concurrent workers
/// and callers never observe a torn job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new PENDING job with its row payload.
    async fn create(&self, job: NewJob) -> Result<Job, StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Row payload stored at submission.
    async fn payload(&self, job_id: JobId) -> Result<serde_json::Value, StoreError>;

    /// FAIL jobs whose lease expired after `max_claim_attempts` claims.
    async fn fail_abandoned(&self, max_claim_attempts: u32) -> Result<Vec<JobId>, StoreError>;

    /// Exclusively claim the oldest PENDING job, or a PROCESSING job whose
    /// lease expired with fewer than `max_claim_attempts` claims.
    async fn claim_next(
        &self,
        worker: &str,
        lease_ttl: Duration,
        max_claim_attempts: u32,
    ) -> Result<Option<Job>, StoreError>;

    /// Extend the lease. `false` means the worker no longer holds it.
    async fn renew_lease(&self, job_id: JobId, worker: &str, lease_ttl: Duration) -> Result<bool, StoreError>;

    /// Give the lease back without counting the claim as abandoned.
    async fn release_lease(&self, job_id: JobId, worker: &str) -> Result<bool, StoreError>;

    /// Expire the lease now so any worker may reclaim the job. Unlike
    /// [`JobStore::release_lease`] the claim still counts toward
    /// `max_claim_attempts`.
    async fn expire_lease(&self, job_id: JobId, worker: &str) -> Result<bool, StoreError>;

    /// Row indexes that already have a recorded outcome.
    async fn recorded_rows(&self, job_id: JobId) -> Result<Vec<usize>, StoreError>;

    /// Record one row outcome and bump the counters atomically.
    ///
    /// Idempotent per `(job, row_index)`: returns `false` and changes nothing
    /// when the row was already recorded.
    async fn record_row(&self, job_id: JobId, record: RowRecord) -> Result<bool, StoreError>;

    /// `PROCESSING → COMPLETED` iff every row has been recorded. Returns
    /// `true` for exactly one caller.
    async fn try_complete(&self, job_id: JobId) -> Result<bool, StoreError>;

    /// Any non-terminal status → FAILED.
    async fn fail(&self, job_id: JobId, reason: &str) -> Result<bool, StoreError>;

    /// Any non-terminal status → CANCELLED. Returns the status after the
    /// call (the existing terminal status when already finished).
    async fn cancel(&self, job_id: JobId) -> Result<JobStatus, StoreError>;

    /// Counters plus the first `error_cap` row errors, from one consistent
    /// read.
    async fn progress(&self, job_id: JobId, error_cap: usize) -> Result<Option<JobProgress>, StoreError>;

    /// Jobs visible under `filter`, newest first.
    async fn list(&self, filter: &ReadFilter, limit: usize) -> Result<Vec<Job>, StoreError>;
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, StoreError> {
    chrono::Duration::from_std(ttl)
        .map(|d| now + d)
        .map_err(|e| StoreError::Storage(format!("invalid lease ttl: {e}")))
}

#[derive(Debug)]
struct Entry {
    job: Job,
    payload: serde_json::Value,
    /// Recorded outcomes keyed by row index; `Some` for failures.
    rows: BTreeMap<usize, Option<RowError>>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Entry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Entry>>, StoreError> {
        self.jobs
            .lock()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let (job, payload) = new_job.into_job(JobId::new(), Utc::now());
        self.lock()?.insert(
            job.id,
            Entry {
                job: job.clone(),
                payload,
                rows: BTreeMap::new(),
            },
        );
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock()?.get(&job_id).map(|e| e.job.clone()))
    }

    async fn payload(&self, job_id: JobId) -> Result<serde_json::Value, StoreError> {
        self.lock()?
            .get(&job_id)
            .map(|e| e.payload.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn fail_abandoned(&self, max_claim_attempts: u32) -> Result<Vec<JobId>, StoreError> {
        let now = Utc::now();
        let mut failed = Vec::new();
        for entry in self.lock()?.values_mut() {
            let job = &mut entry.job;
            let expired = job.lease.as_ref().map_or(false, |l| l.is_expired(now));
            if job.status == JobStatus::Processing && expired && job.claim_attempts >= max_claim_attempts {
                job.status = JobStatus::Failed;
                job.failure_reason = Some(format!(
                    "lease expired after {} claim attempts",
                    job.claim_attempts
                ));
                job.lease = None;
                job.completed_at = Some(now);
                failed.push(job.id);
            }
        }
        Ok(failed)
    }

    async fn claim_next(
        &self,
        worker: &str,
        lease_ttl: Duration,
        max_claim_attempts: u32,
    ) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let expires_at = lease_expiry(now, lease_ttl)?;
        let mut jobs = self.lock()?;

        let next = jobs
            .values()
            .filter(|e| e.job.is_claimable(now) && e.job.claim_attempts < max_claim_attempts)
            .min_by(|a, b| {
                a.job
                    .created_at
                    .cmp(&b.job.created_at)
                    .then(a.job.id.cmp(&b.job.id))
            })
            .map(|e| e.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        let job = &mut entry.job;
        job.status = JobStatus::Processing;
        job.lease = Some(Lease {
            owner: worker.to_string(),
            expires_at,
        });
        job.claim_attempts += 1;
        job.started_at.get_or_insert(now);
        Ok(Some(job.clone()))
    }

    async fn renew_lease(&self, job_id: JobId, worker: &str, lease_ttl: Duration) -> Result<bool, StoreError> {
        let expires_at = lease_expiry(Utc::now(), lease_ttl)?;
        let mut jobs = self.lock()?;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound);
        };
        match entry.job.lease.as_mut() {
            Some(lease) if entry.job.status == JobStatus::Processing && lease.owner == worker => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, job_id: JobId, worker: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut jobs = self.lock()?;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound);
        };
        let job = &mut entry.job;
        match job.lease.as_mut() {
            Some(lease) if job.status == JobStatus::Processing && lease.owner == worker => {
                lease.expires_at = now;
                job.claim_attempts = job.claim_attempts.saturating_sub(1);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_lease(&self, job_id: JobId, worker: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut jobs = self.lock()?;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound);
        };
        let job = &mut entry.job;
        match job.lease.as_mut() {
            Some(lease) if job.status == JobStatus::Processing && lease.owner == worker => {
                lease.expires_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recorded_rows(&self, job_id: JobId) -> Result<Vec<usize>, StoreError> {
        self.lock()?
            .get(&job_id)
            .map(|e| e.rows.keys().copied().collect())
            .ok_or(StoreError::NotFound)
    }

    async fn record_row(&self, job_id: JobId, record: RowRecord) -> Result<bool, StoreError> {
        let mut jobs = self.lock()?;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound);
        };
        let row_index = record.row_index();
        if row_index >= entry.job.total_rows {
            return Err(StoreError::Storage(format!(
                "row index {row_index} out of range for {} rows",
                entry.job.total_rows
            )));
        }
        if entry.rows.contains_key(&row_index) {
            return Ok(false);
        }

        let job = &mut entry.job;
        job.processed_rows += 1;
        match record {
            RowRecord::Succeeded { .. } => {
                job.successful_rows += 1;
                entry.rows.insert(row_index, None);
            }
            RowRecord::Failed(err) => {
                job.failed_rows += 1;
                entry.rows.insert(row_index, Some(err));
            }
        }
        Ok(true)
    }

    async fn try_complete(&self, job_id: JobId) -> Result<bool, StoreError> {
        let mut jobs = self.lock()?;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound);
        };
        let job = &mut entry.job;
        if !job.status.can_transition_to(JobStatus::Completed) || job.processed_rows != job.total_rows {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.lease = None;
        Ok(true)
    }

    async fn fail(&self, job_id: JobId, reason: &str) -> Result<bool, StoreError> {
        let mut jobs = self.lock()?;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound);
        };
        let job = &mut entry.job;
        if !job.status.can_transition_to(JobStatus::Failed) {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.failure_reason = Some(reason.to_string());
        job.completed_at = Some(Utc::now());
        job.lease = None;
        Ok(true)
    }

    async fn cancel(&self, job_id: JobId) -> Result<JobStatus, StoreError> {
        let mut jobs = self.lock()?;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound);
        };
        let job = &mut entry.job;
        if job.status.can_transition_to(JobStatus::Cancelled) {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            job.lease = None;
        }
        Ok(job.status)
    }

    async fn progress(&self, job_id: JobId, error_cap: usize) -> Result<Option<JobProgress>, StoreError> {
        let jobs = self.lock()?;
        let Some(entry) = jobs.get(&job_id) else {
            return Ok(None);
        };
        let mut errors = entry.rows.values().flatten();
        let error_log: Vec<RowError> = errors.by_ref().take(error_cap).cloned().collect();
        let truncated = errors.next().is_some();
        Ok(Some(JobProgress::from_job(&entry.job, error_log, truncated)))
    }

    async fn list(&self, filter: &ReadFilter, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.lock()?;
        let mut visible: Vec<Job> = jobs
            .values()
            .map(|e| &e.job)
            .filter(|j| j.visible_under(filter))
            .cloned()
            .collect();
        visible.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        visible.truncate(limit);
        Ok(visible)
    }
}
