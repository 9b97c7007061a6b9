//! Fixtures shared by the unit tests in this crate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use riskbatch_ai::{EnsembleMember, LogisticModel, RiskModel, ScoringAdapter, ScoringConfig, ScoringError};
use riskbatch_auth::ReadFilter;
use riskbatch_core::{
    Company, CompanyId, NewCompany, NewPrediction, Prediction, ReportingPeriod, Scope, Variant,
};

use crate::jobs::store::{InMemoryJobStore, JobStore};
use crate::jobs::types::{Job, JobId, JobProgress, JobStatus, NewJob, RowRecord};
use crate::rows::RawRow;
use crate::store::{InsertOutcome, PredictionQuery, RecordStore, StoreError};

/// `return_on_assets` value that makes the annual model fail.
pub const EXPLODING_ROA: f64 = 0.666;

/// `return_on_assets` value that makes the annual model panic.
pub const PANICKING_ROA: f64 = 0.777;

/// Annual model that fails on [`EXPLODING_ROA`] and panics on
/// [`PANICKING_ROA`].
struct Exploding(LogisticModel);

impl RiskModel for Exploding {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn variant(&self) -> Variant {
        self.0.variant()
    }

    fn predict_proba(&self, features: &[f64]) -> Result<f64, ScoringError> {
        if features.last() == Some(&EXPLODING_ROA) {
            return Err(ScoringError::inference("model crashed"));
        }
        if features.last() == Some(&PANICKING_ROA) {
            panic!("model state corrupted");
        }
        self.0.predict_proba(features)
    }
}

pub fn adapter() -> Arc<ScoringAdapter> {
    let annual = Exploding(LogisticModel::new(
        "annual_test",
        Variant::Annual,
        -1.0,
        vec![1.5, 0.3, -2.0, -0.05, -3.0],
    ));
    let quarterly = vec![
        EnsembleMember::new(
            0.6,
            LogisticModel::new("quarterly_a", Variant::Quarterly, -1.0, vec![0.3, 0.5, 1.0, -2.0]),
        ),
        EnsembleMember::new(
            0.4,
            LogisticModel::new("quarterly_b", Variant::Quarterly, -0.5, vec![0.2, 0.1, 1.5, -1.0]),
        ),
    ];
    match ScoringAdapter::new(Arc::new(annual), quarterly, ScoringConfig::default()) {
        Ok(a) => Arc::new(a),
        Err(e) => panic!("test adapter must be valid: {e}"),
    }
}

pub fn object(value: Value) -> RawRow {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object row, got {other}"),
    }
}

pub fn annual_row(symbol: &str, year: i32) -> RawRow {
    object(json!({
        "company_symbol": symbol,
        "company_name": format!("{symbol} Inc"),
        "reporting_year": year,
        "long_term_debt_to_total_capital": 0.35,
        "total_debt_to_ebitda": 2.5,
        "net_income_margin": 0.12,
        "ebit_to_interest_expense": 8.0,
        "return_on_assets": 0.07
    }))
}

pub fn quarterly_row(symbol: &str, year: i32, quarter: u8) -> RawRow {
    object(json!({
        "company_symbol": symbol,
        "reporting_year": year,
        "reporting_quarter": format!("Q{quarter}"),
        "total_debt_to_ebitda": 1.8,
        "sga_margin": 0.22,
        "long_term_debt_to_total_capital": 0.4,
        "return_on_capital": 0.09
    }))
}

/// `n` distinct annual rows (one company per row).
pub fn annual_rows(n: usize) -> Vec<RawRow> {
    (0..n).map(|i| annual_row(&format!("C{i}"), 2023)).collect()
}

/// Record store that fails the first `failures` prediction inserts with a
/// transient error.
pub struct FlakyRecordStore<S> {
    pub inner: S,
    failures: std::sync::atomic::AtomicUsize,
    permanent: bool,
}

impl<S> FlakyRecordStore<S> {
    pub fn transient(inner: S, failures: usize) -> Self {
        Self {
            inner,
            failures: failures.into(),
            permanent: false,
        }
    }

    pub fn broken(inner: S) -> Self {
        Self {
            inner,
            failures: usize::MAX.into(),
            permanent: true,
        }
    }

    fn trip(&self) -> Option<StoreError> {
        use std::sync::atomic::Ordering;
        let left = self.failures.load(Ordering::SeqCst);
        if left == 0 {
            return None;
        }
        self.failures.fetch_sub(1, Ordering::SeqCst);
        Some(if self.permanent {
            StoreError::Storage("disk full".to_string())
        } else {
            StoreError::Transient("could not serialize access".to_string())
        })
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for FlakyRecordStore<S> {
    async fn resolve_or_create_company(&self, company: NewCompany) -> Result<CompanyId, StoreError> {
        self.inner.resolve_or_create_company(company).await
    }

    async fn get_company(&self, id: CompanyId) -> Result<Option<Company>, StoreError> {
        self.inner.get_company(id).await
    }

    async fn find_prediction(
        &self,
        company_id: CompanyId,
        period: ReportingPeriod,
        scope: &Scope,
    ) -> Result<Option<Prediction>, StoreError> {
        self.inner.find_prediction(company_id, period, scope).await
    }

    async fn insert_prediction(&self, prediction: NewPrediction) -> Result<InsertOutcome, StoreError> {
        if let Some(err) = self.trip() {
            return Err(err);
        }
        self.inner.insert_prediction(prediction).await
    }

    async fn list_predictions(
        &self,
        filter: &ReadFilter,
        query: &PredictionQuery,
    ) -> Result<Vec<Prediction>, StoreError> {
        self.inner.list_predictions(filter, query).await
    }
}

/// Job store that interferes with a running job at chosen rows.
pub struct ScriptedJobStore {
    pub inner: Arc<InMemoryJobStore>,
    failing_row: Option<usize>,
    failures_left: AtomicUsize,
    cancel_after: Option<usize>,
    steal_after: Option<usize>,
    stolen: AtomicBool,
    lease_checked: Notify,
}

impl ScriptedJobStore {
    pub fn new(inner: Arc<InMemoryJobStore>) -> Self {
        Self {
            inner,
            failing_row: None,
            failures_left: AtomicUsize::new(0),
            cancel_after: None,
            steal_after: None,
            stolen: AtomicBool::new(false),
            lease_checked: Notify::new(),
        }
    }

    /// Recording `row_index` fails with a transient error `times` times.
    pub fn failing_row(mut self, row_index: usize, times: usize) -> Self {
        self.failing_row = Some(row_index);
        self.failures_left = AtomicUsize::new(times);
        self
    }

    /// Cancel the job right after `row_index` is recorded.
    pub fn cancel_after(mut self, row_index: usize) -> Self {
        self.cancel_after = Some(row_index);
        self
    }

    /// Another worker takes the lease right after `row_index` is recorded.
    /// That recording call returns once a renewal has been refused.
    pub fn steal_after(mut self, row_index: usize) -> Self {
        self.steal_after = Some(row_index);
        self
    }

    fn trip(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for ScriptedJobStore {
    async fn create(&self, job: NewJob) -> Result<Job, StoreError> {
        self.inner.create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.inner.get(job_id).await
    }

    async fn payload(&self, job_id: JobId) -> Result<Value, StoreError> {
        self.inner.payload(job_id).await
    }

    async fn fail_abandoned(&self, max_claim_attempts: u32) -> Result<Vec<JobId>, StoreError> {
        self.inner.fail_abandoned(max_claim_attempts).await
    }

    async fn claim_next(
        &self,
        worker: &str,
        lease_ttl: Duration,
        max_claim_attempts: u32,
    ) -> Result<Option<Job>, StoreError> {
        self.inner.claim_next(worker, lease_ttl, max_claim_attempts).await
    }

    async fn renew_lease(&self, job_id: JobId, worker: &str, lease_ttl: Duration) -> Result<bool, StoreError> {
        if self.stolen.load(Ordering::SeqCst) {
            self.lease_checked.notify_one();
            return Ok(false);
        }
        self.inner.renew_lease(job_id, worker, lease_ttl).await
    }

    async fn release_lease(&self, job_id: JobId, worker: &str) -> Result<bool, StoreError> {
        self.inner.release_lease(job_id, worker).await
    }

    async fn expire_lease(&self, job_id: JobId, worker: &str) -> Result<bool, StoreError> {
        self.inner.expire_lease(job_id, worker).await
    }

    async fn recorded_rows(&self, job_id: JobId) -> Result<Vec<usize>, StoreError> {
        self.inner.recorded_rows(job_id).await
    }

    async fn record_row(&self, job_id: JobId, record: RowRecord) -> Result<bool, StoreError> {
        let row_index = record.row_index();
        if self.failing_row == Some(row_index) && self.trip() {
            return Err(StoreError::Transient("deadlock detected".to_string()));
        }
        let fresh = self.inner.record_row(job_id, record).await?;
        if self.cancel_after == Some(row_index) {
            self.inner.cancel(job_id).await?;
        }
        if self.steal_after == Some(row_index) {
            self.stolen.store(true, Ordering::SeqCst);
            self.lease_checked.notified().await;
        }
        Ok(fresh)
    }

    async fn try_complete(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.inner.try_complete(job_id).await
    }

    async fn fail(&self, job_id: JobId, reason: &str) -> Result<bool, StoreError> {
        self.inner.fail(job_id, reason).await
    }

    async fn cancel(&self, job_id: JobId) -> Result<JobStatus, StoreError> {
        self.inner.cancel(job_id).await
    }

    async fn progress(&self, job_id: JobId, error_cap: usize) -> Result<Option<JobProgress>, StoreError> {
        self.inner.progress(job_id, error_cap).await
    }

    async fn list(&self, filter: &ReadFilter, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.inner.list(filter, limit).await
    }
}
