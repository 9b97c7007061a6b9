//! Job orchestrator: intake, status queries and the lease-holding worker
//! loop that drives rows through the [`RowProcessor`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, Span, debug, error, info, instrument, warn};

use riskbatch_ai::ScoringAdapter;
use riskbatch_auth::{Actor, read_filter, resolve};
use riskbatch_core::Prediction;

use super::store::JobStore;
use super::types::{Job, JobId, JobKind, JobProgress, JobStatus, NewJob, RetryPolicy};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::retry::with_retry;
use crate::rows::{JobContext, RawRow, RowProcessor};
use crate::store::{PredictionQuery, RecordStore, StoreError};

/// Rejected submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("batch contains no rows")]
    EmptyBatch,
    #[error("batch has {rows} rows; at most {limit} are accepted")]
    TooManyRows { rows: usize, limit: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failed status/cancel/list request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// Missing, or not visible to the caller.
    #[error("job not found")]
    NotFound,
    #[error("not allowed to modify this job")]
    Forbidden,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fatal, job-level failure (as opposed to a failed row).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job payload is unreadable: {0}")]
    Payload(String),
    #[error("storage unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl JobError {
    /// Storage was briefly unavailable; a later claim may still finish the job.
    fn is_transient(&self) -> bool {
        matches!(self, JobError::Store(e) if e.is_transient())
    }
}

impl From<JoinError> for JobError {
    fn from(err: JoinError) -> Self {
        JobError::Worker(err.to_string())
    }
}

/// Orchestrator runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStats {
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    /// Jobs handed back on shutdown, after losing the lease or after a
    /// transient storage outage.
    pub jobs_released: u64,
    pub rows_processed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running orchestrator.
#[derive(Debug)]
pub struct OrchestratorHandle {
    shutdown: watch::Sender<bool>,
    join: Option<tokio::task::JoinHandle<()>>,
    stats: Arc<Mutex<OrchestratorStats>>,
}

impl OrchestratorHandle {
    /// Request graceful shutdown: stop claiming, let in-flight chunks
    /// finish, release leases of unfinished jobs.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "orchestrator task ended abnormally");
            }
        }
    }

    /// Get current orchestrator statistics.
    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// How dispatch for a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// Every row has an outcome.
    Exhausted,
    /// Status changed underneath us (cancelled or finished elsewhere).
    Stopped(JobStatus),
    LeaseLost,
    Shutdown,
}

/// Bulk prediction job orchestrator.
///
/// Accepts batches, then claims jobs one lease at a time and processes their
/// rows in chunks on a bounded per-job pool. Counters are advanced through
/// idempotent per-row records, so a job reclaimed after a crash resumes
/// where the previous worker stopped.
pub struct JobOrchestrator {
    jobs: Arc<dyn JobStore>,
    records: Arc<dyn RecordStore>,
    processor: Arc<RowProcessor>,
    config: OrchestratorConfig,
    job_slots: Arc<Semaphore>,
    stats: Arc<Mutex<OrchestratorStats>>,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl JobOrchestrator {
    /// Fails when `config` could never make progress (see
    /// [`OrchestratorConfig::validate`]).
    pub fn new(
        jobs: Arc<dyn JobStore>,
        records: Arc<dyn RecordStore>,
        scoring: Arc<ScoringAdapter>,
        config: OrchestratorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let processor = Arc::new(RowProcessor::new(
            records.clone(),
            scoring,
            config.row_retry.clone(),
        ));
        Ok(Self {
            jobs,
            records,
            processor,
            job_slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            stats: Arc::new(Mutex::new(OrchestratorStats::default())),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn bump(&self, f: impl FnOnce(&mut OrchestratorStats)) {
        bump(&self.stats, f);
    }

    /// Accept a batch. The job starts PENDING and is processed asynchronously.
    #[instrument(skip_all, fields(actor = %actor.user_id, kind = %kind, rows = rows.len()))]
    pub async fn submit(&self, actor: &Actor, kind: JobKind, rows: Vec<RawRow>) -> Result<JobId, SubmitError> {
        if rows.is_empty() {
            return Err(SubmitError::EmptyBatch);
        }
        if rows.len() > self.config.max_rows_per_job {
            return Err(SubmitError::TooManyRows {
                rows: rows.len(),
                limit: self.config.max_rows_per_job,
            });
        }

        let scope = resolve(actor);
        let total_rows = rows.len();
        let payload = serde_json::Value::Array(rows.into_iter().map(serde_json::Value::Object).collect());
        let job = self
            .jobs
            .create(NewJob {
                kind,
                owner_id: actor.user_id,
                scope,
                total_rows,
                payload,
            })
            .await?;

        info!(job_id = %job.id, scope = %scope.key(), "job accepted");
        Ok(job.id)
    }

    /// Progress snapshot of a job visible to `actor`.
    pub async fn status(&self, actor: &Actor, job_id: JobId) -> Result<JobProgress, QueryError> {
        self.visible_job(actor, job_id).await?;
        self.jobs
            .progress(job_id, self.config.error_log_cap)
            .await?
            .ok_or(QueryError::NotFound)
    }

    /// Cooperative cancellation: the orchestrator stops dispatching new
    /// chunks; chunks already running finish. Returns the status after the
    /// request (a job that already finished keeps its terminal status).
    #[instrument(skip(self, actor), fields(actor = %actor.user_id))]
    pub async fn cancel(&self, actor: &Actor, job_id: JobId) -> Result<JobStatus, QueryError> {
        let job = self.visible_job(actor, job_id).await?;
        let allowed = job.owner_id == actor.user_id
            || actor.is_platform_admin()
            || job.organization_id.is_some_and(|org| actor.administers(org));
        if !allowed {
            return Err(QueryError::Forbidden);
        }

        let status = self.jobs.cancel(job_id).await?;
        info!(%status, "cancellation requested");
        Ok(status)
    }

    /// Jobs visible to `actor`, newest first.
    pub async fn list_jobs(&self, actor: &Actor, limit: usize) -> Result<Vec<Job>, QueryError> {
        Ok(self.jobs.list(&read_filter(actor), limit).await?)
    }

    /// Predictions visible to `actor`.
    pub async fn list_predictions(
        &self,
        actor: &Actor,
        query: &PredictionQuery,
    ) -> Result<Vec<Prediction>, QueryError> {
        Ok(self.records.list_predictions(&read_filter(actor), query).await?)
    }

    async fn visible_job(&self, actor: &Actor, job_id: JobId) -> Result<Job, QueryError> {
        match self.jobs.get(job_id).await? {
            Some(job) if job.visible_under(&read_filter(actor)) => Ok(job),
            _ => Err(QueryError::NotFound),
        }
    }

    /// Fail abandoned jobs, then claim the next available one.
    async fn claim(&self) -> Result<Option<Job>, JobError> {
        for job_id in self.jobs.fail_abandoned(self.config.max_claim_attempts).await? {
            warn!(%job_id, max_claim_attempts = self.config.max_claim_attempts, "job abandoned; marked failed");
            self.bump(|s| s.jobs_failed += 1);
        }

        let job = self
            .jobs
            .claim_next(&self.config.worker_id, self.config.lease_ttl, self.config.max_claim_attempts)
            .await?;
        if job.is_some() {
            self.bump(|s| s.jobs_claimed += 1);
        }
        Ok(job)
    }

    /// Claim one job and process it to the end (or until it is cancelled).
    ///
    /// Returns `None` when nothing is claimable.
    pub async fn run_next(&self) -> Result<Option<(JobId, JobStatus)>, JobError> {
        let Some(job) = self.claim().await? else {
            return Ok(None);
        };
        let job_id = job.id;
        // Never signalled: run_next runs to completion.
        let (_keep, shutdown) = watch::channel(false);
        let status = self.execute(job, shutdown).await?;
        Ok(Some((job_id, status)))
    }

    /// Spawn the polling worker loop.
    pub fn spawn(self: Arc<Self>) -> OrchestratorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(self.worker_loop(shutdown_rx));
        OrchestratorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    async fn worker_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker = %self.config.worker_id,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            workers_per_job = self.config.workers_per_job,
            "job orchestrator started"
        );
        let started = Instant::now();
        let mut running: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(done) = running.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "job task panicked");
                }
            }
            self.bump(|s| s.uptime_secs = started.elapsed().as_secs());
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.job_slots.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.claim().await {
                Ok(Some(job)) => {
                    let this = self.clone();
                    let stop = shutdown.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        let job_id = job.id;
                        this.bump(|s| s.current_running += 1);
                        if let Err(e) = this.execute(job, stop).await {
                            error!(%job_id, error = %e, "job execution failed");
                        }
                        this.bump(|s| s.current_running = s.current_running.saturating_sub(1));
                    });
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "failed to claim job"),
            }
            drop(permit);

            let stop = tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => false,
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };
            if stop {
                break;
            }
        }

        while running.join_next().await.is_some() {}
        info!(worker = %self.config.worker_id, "job orchestrator stopped");
    }

    #[instrument(skip_all, fields(job_id = %job.id, kind = %job.kind, worker = %self.config.worker_id))]
    async fn execute(&self, job: Job, shutdown: watch::Receiver<bool>) -> Result<JobStatus, JobError> {
        info!(total_rows = job.total_rows, claim_attempt = job.claim_attempts, "job claimed");

        let lease_lost = Arc::new(AtomicBool::new(false));
        let (stop_heartbeat, heartbeat_stopped) = watch::channel(false);
        let heartbeat = tokio::spawn(
            heartbeat(
                self.jobs.clone(),
                job.id,
                self.config.worker_id.clone(),
                self.config.lease_ttl,
                self.config.heartbeat_interval(),
                lease_lost.clone(),
                heartbeat_stopped,
            )
            .instrument(Span::current()),
        );

        let dispatched = self.dispatch(&job, &lease_lost, &shutdown).await;
        let _ = stop_heartbeat.send(true);
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "lease heartbeat task failed");
        }

        let status = self.settle(&job, dispatched).await?;
        match status {
            JobStatus::Completed => self.bump(|s| s.jobs_completed += 1),
            JobStatus::Failed => self.bump(|s| s.jobs_failed += 1),
            JobStatus::Cancelled => self.bump(|s| s.jobs_cancelled += 1),
            JobStatus::Pending | JobStatus::Processing => self.bump(|s| s.jobs_released += 1),
        }
        Ok(status)
    }

    /// Turn the end of dispatch into the job's next status.
    async fn settle(&self, job: &Job, dispatched: Result<Dispatch, JobError>) -> Result<JobStatus, JobError> {
        match dispatched {
            Ok(Dispatch::Exhausted) => {
                if self.jobs.try_complete(job.id).await? {
                    if let Some(done) = self.jobs.get(job.id).await? {
                        info!(
                            succeeded = done.successful_rows,
                            failed = done.failed_rows,
                            "job completed"
                        );
                    }
                    return Ok(JobStatus::Completed);
                }
                let current = self.current_status(job.id).await?;
                if current == JobStatus::Processing {
                    warn!("rows remain unrecorded after dispatch; leaving job for reclaim");
                }
                Ok(current)
            }
            Ok(Dispatch::Stopped(status)) => {
                info!(%status, "job stopped before all rows were dispatched");
                Ok(status)
            }
            Ok(Dispatch::LeaseLost) => {
                let current = self.current_status(job.id).await?;
                warn!(%current, "lease no longer held; abandoning dispatch");
                Ok(current)
            }
            Ok(Dispatch::Shutdown) => {
                self.jobs.release_lease(job.id, &self.config.worker_id).await?;
                info!("shutdown requested; lease released");
                Ok(JobStatus::Processing)
            }
            Err(interrupted) if interrupted.is_transient() => {
                // The claim stays counted, so an outage that outlasts
                // `max_claim_attempts` claims still ends in FAILED.
                warn!(error = %interrupted, "storage unavailable; handing the job back");
                self.jobs.expire_lease(job.id, &self.config.worker_id).await?;
                Ok(JobStatus::Processing)
            }
            Err(fatal) => {
                error!(error = %fatal, "job failed");
                if self.jobs.fail(job.id, &fatal.to_string()).await? {
                    Ok(JobStatus::Failed)
                } else {
                    self.current_status(job.id).await
                }
            }
        }
    }

    async fn current_status(&self, job_id: JobId) -> Result<JobStatus, JobError> {
        self.jobs
            .get(job_id)
            .await?
            .map(|j| j.status)
            .ok_or(JobError::Store(StoreError::NotFound))
    }

    /// Dispatch every unrecorded row in chunks, checking for cancellation,
    /// lease loss and shutdown between chunks.
    async fn dispatch(
        &self,
        job: &Job,
        lease_lost: &Arc<AtomicBool>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Dispatch, JobError> {
        let payload = self.jobs.payload(job.id).await?;
        let rows = decode_rows(payload, job.total_rows)?;

        let recorded: HashSet<usize> = self.jobs.recorded_rows(job.id).await?.into_iter().collect();
        let pending: Vec<(usize, RawRow)> = rows
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !recorded.contains(i))
            .collect();
        if !recorded.is_empty() {
            info!(already_recorded = recorded.len(), remaining = pending.len(), "resuming job");
        }

        let ctx = Arc::new(JobContext::for_job(job));
        let pool = Arc::new(Semaphore::new(self.config.workers_per_job));
        let mut chunks: JoinSet<Result<(), JobError>> = JoinSet::new();
        let mut pending = pending.into_iter().peekable();
        let mut fatal: Option<JobError> = None;
        let mut end = Dispatch::Exhausted;

        while pending.peek().is_some() {
            // Wait for a free slot before checking, so the checks see what
            // the previous chunk left behind.
            let permit = pool
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| JobError::Worker(e.to_string()))?;
            while let Some(done) = chunks.try_join_next() {
                if let Err(e) = done.map_err(JobError::from).and_then(|r| r) {
                    fatal.get_or_insert(e);
                }
            }
            if fatal.is_some() {
                break;
            }
            if lease_lost.load(Ordering::SeqCst) {
                end = Dispatch::LeaseLost;
                break;
            }
            if *shutdown.borrow() {
                end = Dispatch::Shutdown;
                break;
            }
            match self.jobs.get(job.id).await {
                Ok(Some(current)) if current.status == JobStatus::Processing => {}
                Ok(Some(current)) => {
                    end = Dispatch::Stopped(current.status);
                    break;
                }
                Ok(None) => {
                    fatal = Some(JobError::Store(StoreError::NotFound));
                    break;
                }
                Err(e) => {
                    fatal = Some(e.into());
                    break;
                }
            }

            let chunk: Vec<(usize, RawRow)> = pending.by_ref().take(self.config.chunk_size).collect();
            debug!(
                first_row = chunk.first().map(|(i, _)| *i),
                rows = chunk.len(),
                "dispatching chunk"
            );

            let ctx = ctx.clone();
            let processor = self.processor.clone();
            let jobs = self.jobs.clone();
            let retry = self.config.row_retry.clone();
            let stats = self.stats.clone();
            let lease_lost = lease_lost.clone();
            chunks.spawn(
                async move {
                    let _permit = permit;
                    let chunk_run = ChunkRun {
                        ctx: &ctx,
                        processor: &processor,
                        jobs: jobs.as_ref(),
                        retry: &retry,
                        stats: &stats,
                        lease_lost: &lease_lost,
                    };
                    chunk_run.run(chunk).await
                }
                .instrument(Span::current()),
            );
        }

        while let Some(done) = chunks.join_next().await {
            if let Err(e) = done.map_err(JobError::from).and_then(|r| r) {
                fatal.get_or_insert(e);
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(end),
        }
    }
}

fn bump(stats: &Mutex<OrchestratorStats>, f: impl FnOnce(&mut OrchestratorStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

/// Everything a chunk task borrows while it runs.
struct ChunkRun<'a> {
    ctx: &'a JobContext,
    processor: &'a RowProcessor,
    jobs: &'a dyn JobStore,
    retry: &'a RetryPolicy,
    stats: &'a Mutex<OrchestratorStats>,
    lease_lost: &'a AtomicBool,
}

impl ChunkRun<'_> {
    /// Process rows in order, recording each outcome as soon as it exists.
    /// Stops early once the lease belongs to someone else.
    async fn run(&self, chunk: Vec<(usize, RawRow)>) -> Result<(), JobError> {
        for (row_index, raw) in chunk {
            if self.lease_lost.load(Ordering::SeqCst) {
                debug!(row_index, "lease lost; leaving remaining rows to the new owner");
                break;
            }
            let record = self
                .processor
                .process(self.ctx, row_index, &raw)
                .await
                .into_record(row_index);
            let fresh = with_retry(self.retry, "record_row", || {
                self.jobs.record_row(self.ctx.job_id, record.clone())
            })
            .await?;
            if fresh {
                bump(self.stats, |s| s.rows_processed += 1);
            }
        }
        Ok(())
    }
}

/// Renew the lease every `every` until stopped or the lease is lost.
async fn heartbeat(
    jobs: Arc<dyn JobStore>,
    job_id: JobId,
    worker: String,
    ttl: Duration,
    every: Duration,
    lease_lost: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the claim itself set the lease.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => match jobs.renew_lease(job_id, &worker, ttl).await {
                Ok(true) => debug!("lease renewed"),
                Ok(false) => {
                    lease_lost.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => warn!(error = %e, "lease renewal failed"),
            },
        }
    }
}

/// The stored payload must be an array of `total_rows` JSON objects.
fn decode_rows(payload: serde_json::Value, total_rows: usize) -> Result<Vec<RawRow>, JobError> {
    let serde_json::Value::Array(items) = payload else {
        return Err(JobError::Payload("expected an array of rows".to_string()));
    };
    if items.len() != total_rows {
        return Err(JobError::Payload(format!(
            "payload has {} rows, job expects {total_rows}",
            items.len()
        )));
    }
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            serde_json::Value::Object(row) => Ok(row),
            other => Err(JobError::Payload(format!("row {i} is not an object: {other}"))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::RowErrorKind;
    use crate::store::InMemoryRecordStore;
    use crate::testing::{
        EXPLODING_ROA, PANICKING_ROA, ScriptedJobStore, adapter, annual_row, annual_rows, quarterly_row,
    };
    use riskbatch_core::{OrganizationId, UserId};
    use serde_json::json;

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        records: Arc<InMemoryRecordStore>,
        orchestrator: Arc<JobOrchestrator>,
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_worker_id("test-worker")
            .with_chunk_size(7)
            .with_workers_per_job(3)
            .with_poll_interval(Duration::from_millis(5))
            .with_row_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))
    }

    fn fixture_with(config: OrchestratorConfig) -> Fixture {
        let jobs = InMemoryJobStore::arc();
        let records = InMemoryRecordStore::arc();
        let orchestrator = Arc::new(
            JobOrchestrator::new(jobs.clone(), records.clone(), adapter(), config).unwrap(),
        );
        Fixture {
            jobs,
            records,
            orchestrator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(config())
    }

    /// One chunk in flight at a time, so interference lands between chunks.
    fn serial_config() -> OrchestratorConfig {
        config().with_chunk_size(10).with_workers_per_job(1)
    }

    fn scripted_fixture(
        config: OrchestratorConfig,
        script: impl FnOnce(ScriptedJobStore) -> ScriptedJobStore,
    ) -> Fixture {
        let jobs = InMemoryJobStore::arc();
        let records = InMemoryRecordStore::arc();
        let scripted = Arc::new(script(ScriptedJobStore::new(jobs.clone())));
        let orchestrator = Arc::new(
            JobOrchestrator::new(scripted, records.clone(), adapter(), config).unwrap(),
        );
        Fixture {
            jobs,
            records,
            orchestrator,
        }
    }

    #[test]
    fn settings_that_cannot_progress_are_rejected() {
        for config in [
            config().with_chunk_size(0),
            config().with_workers_per_job(0),
            config().with_max_concurrent_jobs(0),
        ] {
            let built = JobOrchestrator::new(
                InMemoryJobStore::arc(),
                InMemoryRecordStore::arc(),
                adapter(),
                config,
            );
            assert!(matches!(built, Err(ConfigError::Invalid { .. })));
        }
    }

    #[tokio::test]
    async fn processes_a_batch_to_completion() {
        let f = fixture();
        let alice = Actor::individual(UserId::new());
        let rows = vec![annual_row("AAPL", 2023), annual_row("MSFT", 2023), annual_row("ORCL", 2022)];
        let job_id = f.orchestrator.submit(&alice, JobKind::Annual, rows).await.unwrap();

        let pending = f.orchestrator.status(&alice, job_id).await.unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(pending.total_rows, 3);

        assert_eq!(
            f.orchestrator.run_next().await.unwrap(),
            Some((job_id, JobStatus::Completed))
        );
        let done = f.orchestrator.status(&alice, job_id).await.unwrap();
        assert_eq!((done.processed_rows, done.successful_rows, done.failed_rows), (3, 3, 0));
        assert!(done.error_log.is_empty());
        assert!(done.completed_at.is_some());

        let predictions = f
            .orchestrator
            .list_predictions(&alice, &PredictionQuery::for_job(job_id))
            .await
            .unwrap();
        assert_eq!(predictions.len(), 3);
        for p in &predictions {
            assert!((0.0..=1.0).contains(&p.score.probability));
            assert_eq!(p.scope, riskbatch_core::Scope::Personal { owner: alice.user_id });
        }
        assert!(f.orchestrator.run_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failing_rows_do_not_stop_the_job() {
        let f = fixture();
        let actor = Actor::individual(UserId::new());
        let mut exploding = annual_row("BOOM", 2023);
        exploding.insert("return_on_assets".into(), json!(EXPLODING_ROA));
        let mut missing = annual_row("GONE", 2023);
        missing.remove("net_income_margin");
        let rows = vec![
            annual_row("A", 2023),
            exploding,
            annual_row("B", 2023),
            missing,
            annual_row("A", 2023),
        ];

        let job_id = f.orchestrator.submit(&actor, JobKind::Annual, rows).await.unwrap();
        f.orchestrator.run_next().await.unwrap();

        let p = f.orchestrator.status(&actor, job_id).await.unwrap();
        assert_eq!(p.status, JobStatus::Completed);
        assert_eq!((p.processed_rows, p.successful_rows, p.failed_rows), (5, 2, 3));
        let kinds: Vec<_> = p.error_log.iter().map(|e| (e.row_index, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (1, RowErrorKind::Scoring),
                (3, RowErrorKind::Validation),
                (4, RowErrorKind::Conflict),
            ]
        );
        assert_eq!(f.records.prediction_count(), 2);
    }

    #[tokio::test]
    async fn quarterly_jobs_score_with_the_ensemble() {
        let f = fixture();
        let actor = Actor::member_of(UserId::new(), OrganizationId::new());
        let rows = (1..=4).map(|q| quarterly_row("NVDA", 2024, q)).collect();
        let job_id = f.orchestrator.submit(&actor, JobKind::Quarterly, rows).await.unwrap();
        f.orchestrator.run_next().await.unwrap();

        let p = f.orchestrator.status(&actor, job_id).await.unwrap();
        assert_eq!((p.status, p.successful_rows), (JobStatus::Completed, 4));
        let predictions = f
            .orchestrator
            .list_predictions(&actor, &PredictionQuery::for_job(job_id))
            .await
            .unwrap();
        assert!(predictions.iter().all(|p| p.score.members.len() == 2));
        assert_eq!(f.records.company_count(), 1);
    }

    #[tokio::test]
    async fn reclaimed_job_resumes_without_duplicates() {
        let f = fixture_with(config().with_chunk_size(10));
        let actor = Actor::individual(UserId::new());
        let job_id = f
            .orchestrator
            .submit(&actor, JobKind::Annual, annual_rows(100))
            .await
            .unwrap();

        // A worker claims the job, gets through 40 rows and dies.
        let job = f
            .jobs
            .claim_next("crashed", Duration::from_millis(1), 3)
            .await
            .unwrap()
            .unwrap();
        let ctx = JobContext::for_job(&job);
        for (i, row) in annual_rows(100).into_iter().enumerate().take(40) {
            let record = f.orchestrator.processor.process(&ctx, i, &row).await.into_record(i);
            f.jobs.record_row(job_id, record).await.unwrap();
        }
        // It also scored row 40 without recording it.
        f.orchestrator.processor.process(&ctx, 40, &annual_row("C40", 2023)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            f.orchestrator.run_next().await.unwrap(),
            Some((job_id, JobStatus::Completed))
        );
        let done = f.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!((done.processed_rows, done.successful_rows), (100, 100));
        assert_eq!(done.claim_attempts, 2);
        assert!(done.counters_consistent());
        assert_eq!(f.records.prediction_count(), 100);
        assert_eq!(f.orchestrator.stats().rows_processed, 60);
    }

    #[tokio::test]
    async fn cancelled_job_dispatches_nothing_more() {
        let f = fixture();
        let actor = Actor::individual(UserId::new());
        let job_id = f
            .orchestrator
            .submit(&actor, JobKind::Annual, annual_rows(20))
            .await
            .unwrap();

        let job = f.orchestrator.claim().await.unwrap().unwrap();
        assert_eq!(f.orchestrator.cancel(&actor, job_id).await.unwrap(), JobStatus::Cancelled);

        let (_tx, rx) = watch::channel(false);
        assert_eq!(f.orchestrator.execute(job, rx).await.unwrap(), JobStatus::Cancelled);
        let p = f.orchestrator.status(&actor, job_id).await.unwrap();
        assert_eq!(p.processed_rows, 0);
        assert_eq!(f.records.prediction_count(), 0);
        assert_eq!(f.orchestrator.stats().jobs_cancelled, 1);

        // Cancelling a finished job reports its terminal status.
        assert_eq!(f.orchestrator.cancel(&actor, job_id).await.unwrap(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_mid_job_lets_the_running_chunk_finish() {
        let f = scripted_fixture(serial_config(), |s| s.cancel_after(14));
        let actor = Actor::individual(UserId::new());
        let job_id = f
            .orchestrator
            .submit(&actor, JobKind::Annual, annual_rows(100))
            .await
            .unwrap();

        assert_eq!(
            f.orchestrator.run_next().await.unwrap(),
            Some((job_id, JobStatus::Cancelled))
        );
        let p = f.orchestrator.status(&actor, job_id).await.unwrap();
        assert_eq!(p.status, JobStatus::Cancelled);
        assert_eq!((p.processed_rows, p.successful_rows), (20, 20));
        assert_eq!(f.records.prediction_count(), 20);
        assert_eq!(f.orchestrator.stats().jobs_cancelled, 1);
        assert!(f.orchestrator.run_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lost_lease_stops_dispatch_without_completing() {
        let config = serial_config().with_lease_ttl(Duration::from_millis(30));
        let f = scripted_fixture(config, |s| s.steal_after(14));
        let actor = Actor::individual(UserId::new());
        let job_id = f
            .orchestrator
            .submit(&actor, JobKind::Annual, annual_rows(100))
            .await
            .unwrap();

        assert_eq!(
            f.orchestrator.run_next().await.unwrap(),
            Some((job_id, JobStatus::Processing))
        );
        let job = f.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.processed_rows, 15);
        assert!(job.completed_at.is_none());
        assert!(job.counters_consistent());
        assert_eq!(f.records.prediction_count(), 15);

        let stats = f.orchestrator.stats();
        assert_eq!((stats.jobs_released, stats.jobs_completed), (1, 0));
        assert_eq!(stats.rows_processed, 15);
    }

    #[tokio::test]
    async fn transient_recording_outage_hands_the_job_back() {
        let f = scripted_fixture(config(), |s| s.failing_row(50, 3));
        let actor = Actor::individual(UserId::new());
        let job_id = f
            .orchestrator
            .submit(&actor, JobKind::Annual, annual_rows(100))
            .await
            .unwrap();

        assert_eq!(
            f.orchestrator.run_next().await.unwrap(),
            Some((job_id, JobStatus::Processing))
        );
        let interrupted = f.jobs.get(job_id).await.unwrap().unwrap();
        assert!(interrupted.failure_reason.is_none());
        assert!(interrupted.processed_rows < 100);
        assert_eq!(interrupted.claim_attempts, 1);
        assert!(interrupted.is_claimable(chrono::Utc::now()));
        assert_eq!(f.orchestrator.stats().jobs_released, 1);

        assert_eq!(
            f.orchestrator.run_next().await.unwrap(),
            Some((job_id, JobStatus::Completed))
        );
        let done = f.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!((done.processed_rows, done.successful_rows), (100, 100));
        assert_eq!(done.claim_attempts, 2);
        assert_eq!(f.records.prediction_count(), 100);
    }

    #[tokio::test]
    async fn outage_outlasting_the_claim_budget_fails_the_job() {
        let f = scripted_fixture(config(), |s| s.failing_row(2, usize::MAX));
        let actor = Actor::individual(UserId::new());
        let job_id = f
            .orchestrator
            .submit(&actor, JobKind::Annual, annual_rows(5))
            .await
            .unwrap();

        for _ in 0..3 {
            assert_eq!(
                f.orchestrator.run_next().await.unwrap(),
                Some((job_id, JobStatus::Processing))
            );
        }
        assert!(f.orchestrator.run_next().await.unwrap().is_none());

        let p = f.orchestrator.status(&actor, job_id).await.unwrap();
        assert_eq!(p.status, JobStatus::Failed);
        assert!(p.failure_reason.unwrap().contains("3 claim attempts"));
        assert_eq!(f.orchestrator.stats().jobs_failed, 1);
    }

    #[tokio::test]
    async fn panicking_model_fails_only_its_row() {
        let f = fixture();
        let actor = Actor::individual(UserId::new());
        let mut panicking = annual_row("PANIC", 2023);
        panicking.insert("return_on_assets".into(), json!(PANICKING_ROA));
        let rows = vec![annual_row("A", 2023), panicking, annual_row("B", 2023)];

        let job_id = f.orchestrator.submit(&actor, JobKind::Annual, rows).await.unwrap();
        assert_eq!(
            f.orchestrator.run_next().await.unwrap(),
            Some((job_id, JobStatus::Completed))
        );
        let p = f.orchestrator.status(&actor, job_id).await.unwrap();
        assert_eq!((p.successful_rows, p.failed_rows), (2, 1));
        assert_eq!(p.error_log[0].row_index, 1);
        assert_eq!(p.error_log[0].kind, RowErrorKind::Scoring);
    }

    #[tokio::test]
    async fn pending_cancelled_job_is_never_claimed() {
        let f = fixture();
        let actor = Actor::individual(UserId::new());
        let job_id = f
            .orchestrator
            .submit(&actor, JobKind::Annual, annual_rows(3))
            .await
            .unwrap();
        f.orchestrator.cancel(&actor, job_id).await.unwrap();
        assert!(f.orchestrator.run_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_releases_the_lease() {
        let f = fixture();
        let actor = Actor::individual(UserId::new());
        let job_id = f
            .orchestrator
            .submit(&actor, JobKind::Annual, annual_rows(10))
            .await
            .unwrap();

        let job = f.orchestrator.claim().await.unwrap().unwrap();
        let (tx, rx) = watch::channel(true);
        assert_eq!(f.orchestrator.execute(job, rx).await.unwrap(), JobStatus::Processing);
        drop(tx);

        let released = f.jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(released.claim_attempts, 0);
        assert!(released.is_claimable(chrono::Utc::now()));
        assert_eq!(
            f.orchestrator.run_next().await.unwrap(),
            Some((job_id, JobStatus::Completed))
        );
    }

    #[tokio::test]
    async fn unreadable_payload_fails_the_job() {
        let f = fixture();
        let actor = Actor::individual(UserId::new());
        let job = f
            .jobs
            .create(NewJob {
                kind: JobKind::Annual,
                owner_id: actor.user_id,
                scope: riskbatch_auth::resolve(&actor),
                total_rows: 2,
                payload: json!([{"company_symbol": "A"}, "not a row"]),
            })
            .await
            .unwrap();

        assert_eq!(
            f.orchestrator.run_next().await.unwrap(),
            Some((job.id, JobStatus::Failed))
        );
        let p = f.orchestrator.status(&actor, job.id).await.unwrap();
        assert!(p.failure_reason.unwrap().contains("row 1 is not an object"));
        assert_eq!(f.orchestrator.stats().jobs_failed, 1);
    }

    #[tokio::test]
    async fn repeatedly_abandoned_job_is_failed() {
        let f = fixture_with(config());
        let actor = Actor::individual(UserId::new());
        let job_id = f
            .orchestrator
            .submit(&actor, JobKind::Annual, annual_rows(1))
            .await
            .unwrap();
        for worker in ["w1", "w2", "w3"] {
            f.jobs
                .claim_next(worker, Duration::from_millis(1), 3)
                .await
                .unwrap()
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(f.orchestrator.run_next().await.unwrap().is_none());
        let p = f.orchestrator.status(&actor, job_id).await.unwrap();
        assert_eq!(p.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn submissions_are_bounded() {
        let f = fixture_with(OrchestratorConfig {
            max_rows_per_job: 5,
            ..config()
        });
        let actor = Actor::individual(UserId::new());
        assert_eq!(
            f.orchestrator.submit(&actor, JobKind::Annual, vec![]).await,
            Err(SubmitError::EmptyBatch)
        );
        assert_eq!(
            f.orchestrator.submit(&actor, JobKind::Annual, annual_rows(6)).await,
            Err(SubmitError::TooManyRows { rows: 6, limit: 5 })
        );
        assert!(f.orchestrator.submit(&actor, JobKind::Annual, annual_rows(5)).await.is_ok());
    }

    #[tokio::test]
    async fn jobs_are_visible_to_owner_org_and_admins_only() {
        let f = fixture();
        let org = OrganizationId::new();
        let owner = Actor::member_of(UserId::new(), org);
        let colleague = Actor::member_of(UserId::new(), org);
        let org_admin = Actor::new(UserId::new(), vec![riskbatch_auth::Role::ORG_ADMIN], Some(org));
        let stranger = Actor::individual(UserId::new());
        let platform = Actor::platform_admin(UserId::new());

        let job_id = f
            .orchestrator
            .submit(&owner, JobKind::Annual, annual_rows(2))
            .await
            .unwrap();

        assert!(f.orchestrator.status(&colleague, job_id).await.is_ok());
        assert!(f.orchestrator.status(&platform, job_id).await.is_ok());
        assert_eq!(
            f.orchestrator.status(&stranger, job_id).await,
            Err(QueryError::NotFound)
        );
        assert_eq!(
            f.orchestrator.cancel(&stranger, job_id).await,
            Err(QueryError::NotFound)
        );
        assert_eq!(
            f.orchestrator.cancel(&colleague, job_id).await,
            Err(QueryError::Forbidden)
        );
        assert_eq!(f.orchestrator.list_jobs(&colleague, 10).await.unwrap().len(), 1);
        assert!(f.orchestrator.list_jobs(&stranger, 10).await.unwrap().is_empty());

        assert_eq!(
            f.orchestrator.cancel(&org_admin, job_id).await.unwrap(),
            JobStatus::Cancelled
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_loop_drains_submitted_jobs() {
        let f = fixture();
        let actor = Actor::individual(UserId::new());
        let handle = f.orchestrator.clone().spawn();

        let mut ids = Vec::new();
        for n in [30, 12, 1] {
            let rows = (0..n).map(|i| annual_row(&format!("J{n}R{i}"), 2023)).collect();
            ids.push(f.orchestrator.submit(&actor, JobKind::Annual, rows).await.unwrap());
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let mut done = true;
            for id in &ids {
                let p = f.orchestrator.status(&actor, *id).await.unwrap();
                done &= p.status == JobStatus::Completed;
            }
            if done && handle.stats().jobs_completed == 3 {
                break;
            }
            assert!(Instant::now() < deadline, "jobs did not finish in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = handle.stats();
        assert_eq!(stats.jobs_completed, 3);
        assert_eq!(stats.rows_processed, 43);
        handle.shutdown().await;

        for id in ids {
            assert!(f.jobs.get(id).await.unwrap().unwrap().counters_consistent());
        }
    }
}
