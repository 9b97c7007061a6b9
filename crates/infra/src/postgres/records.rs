//! Postgres record store.
//!
//! ## Uniqueness
//!
//! `companies (symbol, scope_key)` and the `predictions_key` index carry the
//! uniqueness rules. Both inserts use `ON CONFLICT DO NOTHING`, so concurrent
//! rows racing on the same key converge instead of erroring.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};

use riskbatch_auth::ReadFilter;
use riskbatch_core::{
    Company, CompanyId, JobId, MemberProbability, NewCompany, NewPrediction, Prediction, PredictionId,
    RatioInput, ReportingPeriod, RiskScore, Scope, SourceRow, UserId,
};

use super::{is_unique_violation, map_sqlx_error, to_i32, to_usize};
use crate::store::{InsertOutcome, PredictionQuery, RecordStore, StoreError};

const PREDICTION_COLUMNS: &str = r#"
    id, company_id, scope_key, reporting_year, reporting_quarter, ratios,
    probability, risk_tier, confidence, members, created_by,
    source_job_id, source_row_index, created_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn find_company_id(&self, symbol: &str, scope_key: &str) -> Result<Option<CompanyId>, StoreError> {
        let row = sqlx::query("SELECT id FROM companies WHERE symbol = $1 AND scope_key = $2")
            .bind(symbol)
            .bind(scope_key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_company", e))?;
        row.map(|r| r.try_get::<uuid::Uuid, _>("id").map(CompanyId::from_uuid))
            .transpose()
            .map_err(|e| map_sqlx_error("find_company", e))
    }

    async fn existing_prediction(
        &self,
        company_id: CompanyId,
        period: ReportingPeriod,
        scope_key: &str,
    ) -> Result<Option<Prediction>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {PREDICTION_COLUMNS}
            FROM predictions
            WHERE company_id = $1
              AND reporting_year = $2
              AND COALESCE(reporting_quarter, 0) = $3
              AND scope_key = $4
            "#
        ))
        .bind(company_id.as_uuid())
        .bind(period.year)
        .bind(i16::from(period.quarter.unwrap_or(0)))
        .bind(scope_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_prediction", e))?;

        row.map(|r| decode_prediction("find_prediction", &r)).transpose()
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self, company), fields(symbol = %company.symbol, scope = %company.scope), err)]
    async fn resolve_or_create_company(&self, company: NewCompany) -> Result<CompanyId, StoreError> {
        let scope_key = company.scope.key();
        let inserted = sqlx::query(
            r#"
            INSERT INTO companies (id, symbol, name, sector, scope_key, organization_id, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (symbol, scope_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(CompanyId::new().as_uuid())
        .bind(&company.symbol)
        .bind(&company.name)
        .bind(&company.sector)
        .bind(&scope_key)
        .bind(company.scope.organization_id().map(|o| *o.as_uuid()))
        .bind(company.created_by.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_company", e))?;

        if let Some(row) = inserted {
            let id: uuid::Uuid = row.try_get("id").map_err(|e| map_sqlx_error("insert_company", e))?;
            return Ok(CompanyId::from_uuid(id));
        }

        // Lost the race (or the company already existed): read the winner.
        self.find_company_id(&company.symbol, &scope_key)
            .await?
            .ok_or_else(|| StoreError::Transient("company vanished after insert conflict".to_string()))
    }

    #[instrument(skip(self), err)]
    async fn get_company(&self, id: CompanyId) -> Result<Option<Company>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, symbol, name, sector, scope_key, created_by, created_at
            FROM companies
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_company", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let scope_key: String = row.try_get("scope_key").map_err(|e| map_sqlx_error("get_company", e))?;
        let decode = |e| map_sqlx_error("get_company", e);
        Ok(Some(Company {
            id: CompanyId::from_uuid(row.try_get("id").map_err(decode)?),
            symbol: row.try_get("symbol").map_err(decode)?,
            name: row.try_get("name").map_err(decode)?,
            sector: row.try_get("sector").map_err(decode)?,
            scope: decode_scope(&scope_key)?,
            created_by: UserId::from_uuid(row.try_get("created_by").map_err(decode)?),
            created_at: row.try_get("created_at").map_err(decode)?,
        }))
    }

    #[instrument(skip(self), fields(period = %period), err)]
    async fn find_prediction(
        &self,
        company_id: CompanyId,
        period: ReportingPeriod,
        scope: &Scope,
    ) -> Result<Option<Prediction>, StoreError> {
        self.existing_prediction(company_id, period, &scope.key()).await
    }

    #[instrument(
        skip(self, prediction),
        fields(company_id = %prediction.company_id, period = %prediction.period),
        err
    )]
    async fn insert_prediction(&self, prediction: NewPrediction) -> Result<InsertOutcome, StoreError> {
        let scope_key = prediction.scope.key();
        let ratios = serde_json::to_value(prediction.ratios)
            .map_err(|e| StoreError::Storage(format!("failed to encode ratios: {e}")))?;
        let members = serde_json::to_value(&prediction.score.members)
            .map_err(|e| StoreError::Storage(format!("failed to encode members: {e}")))?;
        let source_row_index = prediction
            .source
            .map(|s| to_i32(s.row_index, "row index"))
            .transpose()?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO predictions (
                id, company_id, scope_key, organization_id, reporting_year, reporting_quarter,
                ratios, probability, risk_tier, confidence, members, created_by,
                source_job_id, source_row_index
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (company_id, reporting_year, (COALESCE(reporting_quarter, 0)), scope_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(PredictionId::new().as_uuid())
        .bind(prediction.company_id.as_uuid())
        .bind(&scope_key)
        .bind(prediction.scope.organization_id().map(|o| *o.as_uuid()))
        .bind(prediction.period.year)
        .bind(prediction.period.quarter.map(i16::from))
        .bind(&ratios)
        .bind(prediction.score.probability)
        .bind(prediction.score.risk_tier.as_str())
        .bind(prediction.score.confidence)
        .bind(&members)
        .bind(prediction.created_by.as_uuid())
        .bind(prediction.source.map(|s| *s.job_id.as_uuid()))
        .bind(source_row_index)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                // Only the primary key can still collide here.
                StoreError::Transient(format!("prediction id collision: {e}"))
            } else {
                map_sqlx_error("insert_prediction", e)
            }
        })?;

        if let Some(row) = inserted {
            let id: uuid::Uuid = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("insert_prediction", e))?;
            return Ok(InsertOutcome::Inserted(PredictionId::from_uuid(id)));
        }

        match self
            .existing_prediction(prediction.company_id, prediction.period, &scope_key)
            .await?
        {
            Some(existing) => Ok(InsertOutcome::Conflict {
                existing: existing.id,
                source: existing.source,
            }),
            None => {
                warn!("prediction conflict without a visible winner");
                Err(StoreError::Transient(
                    "prediction vanished after insert conflict".to_string(),
                ))
            }
        }
    }

    #[instrument(skip(self, filter), fields(limit = query.limit, offset = query.offset), err)]
    async fn list_predictions(
        &self,
        filter: &ReadFilter,
        query: &PredictionQuery,
    ) -> Result<Vec<Prediction>, StoreError> {
        let quarterly = query.variant.map(|v| v == riskbatch_core::Variant::Quarterly);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PREDICTION_COLUMNS}
            FROM predictions
            WHERE ($1::text[] IS NULL OR scope_key = ANY($1))
              AND ($2::boolean IS NULL OR (reporting_quarter IS NOT NULL) = $2)
              AND ($3::uuid IS NULL OR company_id = $3)
              AND ($4::integer IS NULL OR reporting_year = $4)
              AND ($5::uuid IS NULL OR source_job_id = $5)
            ORDER BY created_at DESC, id DESC
            LIMIT $6 OFFSET $7
            "#
        ))
        .bind(filter.allowed_scope_keys())
        .bind(quarterly)
        .bind(query.company_id.map(|c| *c.as_uuid()))
        .bind(query.year)
        .bind(query.source_job_id.map(|j| *j.as_uuid()))
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(query.offset).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_predictions", e))?;

        rows.iter()
            .map(|r| decode_prediction("list_predictions", r))
            .collect()
    }
}

fn decode_scope(key: &str) -> Result<Scope, StoreError> {
    Scope::from_key(key).map_err(|e| StoreError::Corrupt(format!("bad scope key '{key}': {e}")))
}

// SQLx row types

#[derive(Debug)]
struct PredictionRow {
    id: uuid::Uuid,
    company_id: uuid::Uuid,
    scope_key: String,
    reporting_year: i32,
    reporting_quarter: Option<i16>,
    ratios: serde_json::Value,
    probability: f64,
    risk_tier: String,
    confidence: f64,
    members: serde_json::Value,
    created_by: uuid::Uuid,
    source_job_id: Option<uuid::Uuid>,
    source_row_index: Option<i32>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for PredictionRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(PredictionRow {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            scope_key: row.try_get("scope_key")?,
            reporting_year: row.try_get("reporting_year")?,
            reporting_quarter: row.try_get("reporting_quarter")?,
            ratios: row.try_get("ratios")?,
            probability: row.try_get("probability")?,
            risk_tier: row.try_get("risk_tier")?,
            confidence: row.try_get("confidence")?,
            members: row.try_get("members")?,
            created_by: row.try_get("created_by")?,
            source_job_id: row.try_get("source_job_id")?,
            source_row_index: row.try_get("source_row_index")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<PredictionRow> for Prediction {
    type Error = StoreError;

    fn try_from(row: PredictionRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("prediction {}: bad {what}: {e}", row.id))
        };
        let scope = decode_scope(&row.scope_key)?;
        let period = match row.reporting_quarter {
            Some(q) => u8::try_from(q)
                .map_err(|e| corrupt("quarter", &e))
                .and_then(|q| ReportingPeriod::quarterly(row.reporting_year, q).map_err(|e| corrupt("quarter", &e))),
            None => ReportingPeriod::annual(row.reporting_year).map_err(|e| corrupt("year", &e)),
        }?;
        let ratios: RatioInput =
            serde_json::from_value(row.ratios.clone()).map_err(|e| corrupt("ratios", &e))?;
        let members: Vec<MemberProbability> =
            serde_json::from_value(row.members.clone()).map_err(|e| corrupt("members", &e))?;
        let risk_tier = row.risk_tier.parse().map_err(|e| corrupt("risk tier", &e))?;
        let source = match (row.source_job_id, row.source_row_index) {
            (Some(job_id), Some(index)) => Some(SourceRow {
                job_id: JobId::from_uuid(job_id),
                row_index: to_usize(index, "source row index")?,
            }),
            _ => None,
        };

        Ok(Prediction {
            id: PredictionId::from_uuid(row.id),
            company_id: CompanyId::from_uuid(row.company_id),
            organization_id: scope.organization_id(),
            scope,
            period,
            ratios,
            score: RiskScore {
                probability: row.probability,
                risk_tier,
                confidence: row.confidence,
                members,
            },
            created_by: UserId::from_uuid(row.created_by),
            source,
            created_at: row.created_at,
        })
    }
}

fn decode_prediction(operation: &str, row: &sqlx::postgres::PgRow) -> Result<Prediction, StoreError> {
    use sqlx::FromRow;
    let row = PredictionRow::from_row(row).map_err(|e| map_sqlx_error(operation, e))?;
    row.try_into()
}
