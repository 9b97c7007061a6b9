//! Bulk prediction jobs.
//!
//! ## Design
//!
//! - A job owns a decoded row payload and atomic progress counters
//! - Workers hold a renewable lease; an expired lease makes the job
//!   claimable again, and too many claims mark it FAILED
//! - Row outcomes are recorded once per `(job, row_index)`, so a reclaimed
//!   job resumes instead of starting over
//! - Cancellation is cooperative and checked between chunks
//! - A transient storage outage hands the job back (lease expired, claim
//!   counted) instead of failing it
//!
//! ## Components
//!
//! - `Job`, `JobProgress`: job metadata and the pollable status snapshot
//! - `JobStore`: persistence for jobs (in-memory or Postgres)
//! - `JobOrchestrator`: intake, queries and the lease-holding worker loop

pub mod orchestrator;
pub mod store;
pub mod types;

pub use orchestrator::{
    JobError, JobOrchestrator, OrchestratorHandle, OrchestratorStats, QueryError, SubmitError,
};
pub use store::{InMemoryJobStore, JobStore};
pub use types::{
    BackoffStrategy, Job, JobId, JobKind, JobProgress, JobStatus, Lease, NewJob, RetryPolicy,
    RowError, RowErrorKind, RowRecord,
};
