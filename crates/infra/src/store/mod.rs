//! Record storage: companies and predictions.
//!
//! ## Design
//!
//! - Uniqueness lives in storage, not in callers: `(symbol, scope)` for
//!   companies and `(company, period, scope)` for predictions.
//! - Company creation is insert-if-absent; concurrent callers converge on
//!   the same id.
//! - A duplicate prediction is reported as [`InsertOutcome::Conflict`],
//!   never overwritten.

mod in_memory;

use async_trait::async_trait;
use serde::Serialize;

use riskbatch_auth::ReadFilter;
use riskbatch_core::{
    Company, CompanyId, JobId, NewCompany, NewPrediction, Prediction, PredictionId, ReportingPeriod, Scope,
    SourceRow, Variant,
};

pub use in_memory::InMemoryRecordStore;

/// Storage error shared by the record and job stores.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    /// Safe to retry (deadlock, serialization failure, pool timeout).
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Result of inserting a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted(PredictionId),
    /// A prediction already exists for the key.
    Conflict {
        existing: PredictionId,
        source: Option<SourceRow>,
    },
}

/// Filters for listing predictions. Visibility is applied separately through
/// a [`ReadFilter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredictionQuery {
    pub variant: Option<Variant>,
    pub company_id: Option<CompanyId>,
    pub year: Option<i32>,
    pub source_job_id: Option<JobId>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for PredictionQuery {
    fn default() -> Self {
        Self {
            variant: None,
            company_id: None,
            year: None,
            source_job_id: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl PredictionQuery {
    pub fn for_job(job_id: JobId) -> Self {
        Self {
            source_job_id: Some(job_id),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, p: &Prediction) -> bool {
        self.variant.map_or(true, |v| p.variant() == v)
            && self.company_id.map_or(true, |c| p.company_id == c)
            && self.year.map_or(true, |y| p.period.year == y)
            && self.source_job_id.map_or(true, |j| p.source_job_id() == Some(j))
    }
}

/// Company and prediction persistence.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Return the id of the company keyed by `(company.symbol, company.scope)`,
    /// creating it if absent. Never mutates an existing company.
    async fn resolve_or_create_company(&self, company: NewCompany) -> Result<CompanyId, StoreError>;

    async fn get_company(&self, id: CompanyId) -> Result<Option<Company>, StoreError>;

    /// Prediction at `(company_id, period, scope)`, if any.
    async fn find_prediction(
        &self,
        company_id: CompanyId,
        period: ReportingPeriod,
        scope: &Scope,
    ) -> Result<Option<Prediction>, StoreError>;

    /// Insert unless a prediction already exists for the key.
    async fn insert_prediction(&self, prediction: NewPrediction) -> Result<InsertOutcome, StoreError>;

    /// Predictions visible under `filter`, newest first.
    async fn list_predictions(
        &self,
        filter: &ReadFilter,
        query: &PredictionQuery,
    ) -> Result<Vec<Prediction>, StoreError>;
}
