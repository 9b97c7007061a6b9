//! Core job types and policies.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use riskbatch_auth::ReadFilter;
use riskbatch_core::{DomainError, OrganizationId, Scope, UserId, Variant};

pub use riskbatch_core::JobId;

/// Which model family a whole batch is scored with.
pub type JobKind = Variant;

/// Job lifecycle status.
///
/// `Pending → Processing → {Completed, Failed, Cancelled}`. Terminal states
/// are final.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting to be claimed
    Pending,
    /// Claimed by a worker holding a lease
    Processing,
    /// Every row produced an outcome
    Completed,
    /// Fatal, non-row error
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self → next` is a legal lifecycle step.
    ///
    /// `Processing → Processing` is allowed: it is a lease takeover.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing)
            | (JobStatus::Pending, JobStatus::Failed)
            | (JobStatus::Pending, JobStatus::Cancelled) => true,
            (JobStatus::Processing, JobStatus::Processing)
            | (JobStatus::Processing, JobStatus::Completed)
            | (JobStatus::Processing, JobStatus::Failed)
            | (JobStatus::Processing, JobStatus::Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Classification of a failed row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorKind {
    /// Bad input row; user-fixable, never retried.
    Validation,
    /// Duplicate prediction key; never retried.
    Conflict,
    /// Model or storage failure after bounded retries.
    Scoring,
}

impl RowErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowErrorKind::Validation => "validation",
            RowErrorKind::Conflict => "conflict",
            RowErrorKind::Scoring => "scoring",
        }
    }
}

impl FromStr for RowErrorKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(RowErrorKind::Validation),
            "conflict" => Ok(RowErrorKind::Conflict),
            "scoring" => Ok(RowErrorKind::Scoring),
            other => Err(DomainError::validation(format!("unknown row error kind '{other}'"))),
        }
    }
}

/// One entry of a job's error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row_index: usize,
    pub kind: RowErrorKind,
    pub message: String,
}

/// What a worker records for one attempted row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RowRecord {
    Succeeded { row_index: usize },
    Failed(RowError),
}

impl RowRecord {
    pub fn row_index(&self) -> usize {
        match self {
            RowRecord::Succeeded { row_index } => *row_index,
            RowRecord::Failed(e) => e.row_index,
        }
    }
}

/// Time-bounded claim a worker holds on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A bulk prediction job (metadata and counters; the row payload and error
/// log are stored alongside and read separately).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub owner_id: UserId,
    pub organization_id: Option<OrganizationId>,
    /// Scope stamped on every record the job creates.
    pub scope: Scope,
    pub status: JobStatus,
    pub total_rows: usize,
    pub processed_rows: usize,
    pub successful_rows: usize,
    pub failed_rows: usize,
    pub lease: Option<Lease>,
    /// Number of times a worker has claimed the job.
    pub claim_attempts: u32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Counter invariant: `processed == successful + failed <= total`.
    pub fn counters_consistent(&self) -> bool {
        self.processed_rows == self.successful_rows + self.failed_rows
            && self.processed_rows <= self.total_rows
    }

    /// Jobs are visible to their owner, to members of the owning
    /// organization and to platform administrators.
    pub fn visible_under(&self, filter: &ReadFilter) -> bool {
        match filter {
            ReadFilter::Unrestricted => true,
            ReadFilter::Restricted {
                user_id,
                organization_id,
            } => {
                self.owner_id == *user_id
                    || (self.organization_id.is_some() && self.organization_id == *organization_id)
            }
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Processing => self.lease.as_ref().map_or(true, |l| l.is_expired(now)),
            _ => false,
        }
    }
}

/// Insert request for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: JobKind,
    pub owner_id: UserId,
    pub scope: Scope,
    pub total_rows: usize,
    /// Decoded rows, as a JSON array of objects.
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn into_job(self, id: JobId, created_at: DateTime<Utc>) -> (Job, serde_json::Value) {
        let job = Job {
            id,
            kind: self.kind,
            owner_id: self.owner_id,
            organization_id: self.scope.organization_id(),
            scope: self.scope,
            status: JobStatus::Pending,
            total_rows: self.total_rows,
            processed_rows: 0,
            successful_rows: 0,
            failed_rows: 0,
            lease: None,
            claim_attempts: 0,
            failure_reason: None,
            created_at,
            started_at: None,
            completed_at: None,
        };
        (job, self.payload)
    }
}

/// Consistent, pollable snapshot of a job's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub total_rows: usize,
    pub processed_rows: usize,
    pub successful_rows: usize,
    pub failed_rows: usize,
    /// Failed rows ordered by row index, capped.
    pub error_log: Vec<RowError>,
    /// True when more errors exist than `error_log` carries.
    pub error_log_truncated: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobProgress {
    pub fn from_job(job: &Job, error_log: Vec<RowError>, error_log_truncated: bool) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            status: job.status,
            total_rows: job.total_rows,
            processed_rows: job.processed_rows,
            successful_rows: job.successful_rows,
            failed_rows: job.failed_rows,
            error_log,
            error_log_truncated,
            failure_reason: job.failure_reason.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy for transient storage failures inside a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (1 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => {
                let linear = base_ms * (attempt as f64);
                linear.min(max_ms)
            }
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(250))
        };
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(250));
    }

    #[test]
    fn should_retry_counts_the_first_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn expired_lease_makes_processing_job_claimable() {
        let (mut job, _) = NewJob {
            kind: JobKind::Annual,
            owner_id: UserId::new(),
            scope: Scope::System,
            total_rows: 1,
            payload: serde_json::json!([{}]),
        }
        .into_job(JobId::new(), Utc::now());
        let now = Utc::now();
        assert!(job.is_claimable(now));

        job.status = JobStatus::Processing;
        job.lease = Some(Lease {
            owner: "w1".to_string(),
            expires_at: now + chrono::Duration::seconds(30),
        });
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in ["pending", "processing", "completed", "failed", "cancelled"] {
            assert_eq!(s.parse::<JobStatus>().unwrap().as_str(), s);
        }
    }
}
