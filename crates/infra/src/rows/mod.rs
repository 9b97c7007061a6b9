//! Row processing: one raw row in, one [`RowOutcome`] out.
//!
//! Rows are independent. A failing row produces a failed outcome and never
//! aborts its siblings; the processor itself never returns an error.

mod parse;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use riskbatch_ai::ScoringAdapter;
use riskbatch_core::{JobId, NewPrediction, PredictionId, ReportingPeriod, Scope, SourceRow, UserId};

use crate::company::{CompanyDetails, CompanyResolver};
use crate::jobs::types::{Job, JobKind, RetryPolicy, RowError, RowErrorKind, RowRecord};
use crate::retry::with_retry;
use crate::store::{InsertOutcome, RecordStore};

pub use parse::{ParsedRow, RawRow, RowParseError, parse_row};

/// The slice of a job every row needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: JobId,
    pub kind: JobKind,
    /// Scope stamped on every company and prediction the job creates.
    pub scope: Scope,
    pub created_by: UserId,
}

impl JobContext {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            scope: job.scope,
            created_by: job.owner_id,
        }
    }
}

/// Result of processing one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RowOutcome {
    Success { prediction_id: PredictionId },
    ValidationError { message: String },
    ConflictError { existing_prediction_id: PredictionId, message: String },
    ScoringError { message: String },
}

impl RowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RowOutcome::Success { .. })
    }

    pub fn error_kind(&self) -> Option<RowErrorKind> {
        match self {
            RowOutcome::Success { .. } => None,
            RowOutcome::ValidationError { .. } => Some(RowErrorKind::Validation),
            RowOutcome::ConflictError { .. } => Some(RowErrorKind::Conflict),
            RowOutcome::ScoringError { .. } => Some(RowErrorKind::Scoring),
        }
    }

    pub fn into_record(self, row_index: usize) -> RowRecord {
        let (kind, message) = match self {
            RowOutcome::Success { .. } => return RowRecord::Succeeded { row_index },
            RowOutcome::ValidationError { message } => (RowErrorKind::Validation, message),
            RowOutcome::ConflictError { message, .. } => (RowErrorKind::Conflict, message),
            RowOutcome::ScoringError { message } => (RowErrorKind::Scoring, message),
        };
        RowRecord::Failed(RowError {
            row_index,
            kind,
            message,
        })
    }
}

/// Validates, resolves, scores and persists individual rows.
pub struct RowProcessor {
    records: Arc<dyn RecordStore>,
    companies: CompanyResolver,
    scoring: Arc<ScoringAdapter>,
    retry: RetryPolicy,
}

impl RowProcessor {
    pub fn new(records: Arc<dyn RecordStore>, scoring: Arc<ScoringAdapter>, retry: RetryPolicy) -> Self {
        Self {
            companies: CompanyResolver::new(records.clone()),
            records,
            scoring,
            retry,
        }
    }

    #[instrument(skip(self, ctx, raw), fields(job_id = %ctx.job_id))]
    pub async fn process(&self, ctx: &JobContext, row_index: usize, raw: &RawRow) -> RowOutcome {
        let outcome = self.run(ctx, row_index, raw).await;
        match &outcome {
            RowOutcome::Success { prediction_id } => debug!(%prediction_id, "row scored"),
            other => debug!(outcome = ?other, "row failed"),
        }
        outcome
    }

    async fn run(&self, ctx: &JobContext, row_index: usize, raw: &RawRow) -> RowOutcome {
        let source = SourceRow {
            job_id: ctx.job_id,
            row_index,
        };
        let row = match parse_row(ctx.kind, raw, &self.scoring.config().bounds) {
            Ok(row) => row,
            Err(e) => {
                return RowOutcome::ValidationError {
                    message: e.to_string(),
                };
            }
        };

        let details = CompanyDetails {
            name: row.company_name.clone(),
            sector: row.sector.clone(),
        };
        let company_id = match with_retry(&self.retry, "resolve_company", || {
            self.companies
                .resolve_or_create(&row.symbol, ctx.scope, ctx.created_by, details.clone())
        })
        .await
        {
            Ok(id) => id,
            Err(e) => {
                return RowOutcome::ScoringError {
                    message: format!("company resolution failed: {e}"),
                };
            }
        };

        match with_retry(&self.retry, "find_prediction", || {
            self.records.find_prediction(company_id, row.period, &ctx.scope)
        })
        .await
        {
            Ok(Some(existing)) => {
                return existing_outcome(source, &row.symbol, row.period, existing.id, existing.source);
            }
            Ok(None) => {}
            Err(e) => {
                return RowOutcome::ScoringError {
                    message: format!("prediction lookup failed: {e}"),
                };
            }
        }

        let score = match self.scoring.score(&row.ratios) {
            Ok(score) => score,
            Err(e) => {
                return RowOutcome::ScoringError {
                    message: e.to_string(),
                };
            }
        };

        let prediction = NewPrediction {
            company_id,
            scope: ctx.scope,
            period: row.period,
            ratios: row.ratios,
            score,
            created_by: ctx.created_by,
            source: Some(source),
        };
        match with_retry(&self.retry, "insert_prediction", || {
            self.records.insert_prediction(prediction.clone())
        })
        .await
        {
            Ok(InsertOutcome::Inserted(prediction_id)) => RowOutcome::Success { prediction_id },
            Ok(InsertOutcome::Conflict {
                existing,
                source: existing_source,
            }) => existing_outcome(source, &row.symbol, row.period, existing, existing_source),
            Err(e) => RowOutcome::ScoringError {
                message: format!("failed to persist prediction: {e}"),
            },
        }
    }
}

/// A prediction already exists for the row's key. If this very row created
/// it, the row was processed before a lease takeover and counts as a success;
/// anything else (including a duplicate row in the same batch) conflicts.
fn existing_outcome(
    row: SourceRow,
    symbol: &str,
    period: ReportingPeriod,
    existing: PredictionId,
    existing_source: Option<SourceRow>,
) -> RowOutcome {
    if existing_source == Some(row) {
        return RowOutcome::Success {
            prediction_id: existing,
        };
    }
    RowOutcome::ConflictError {
        existing_prediction_id: existing,
        message: format!("a {period} prediction for {symbol} already exists ({existing})"),
    }
}
