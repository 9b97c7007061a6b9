use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use riskbatch_auth::ReadFilter;
use riskbatch_core::{
    Company, CompanyId, NewCompany, NewPrediction, Prediction, PredictionId, ReportingPeriod, Scope,
};

use super::{InsertOutcome, PredictionQuery, RecordStore, StoreError};

type PredictionKey = (CompanyId, ReportingPeriod, String);

#[derive(Debug, Default)]
struct Inner {
    companies: HashMap<CompanyId, Company>,
    company_keys: HashMap<(String, String), CompanyId>,
    predictions: HashMap<PredictionId, Prediction>,
    prediction_keys: HashMap<PredictionKey, PredictionId>,
}

/// In-memory record store for tests/dev.
///
/// A single mutex makes each operation atomic, which gives the same
/// uniqueness guarantees the Postgres constraints give.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    inner: Mutex<Inner>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn company_count(&self) -> usize {
        self.inner.lock().map(|i| i.companies.len()).unwrap_or(0)
    }

    pub fn prediction_count(&self) -> usize {
        self.inner.lock().map(|i| i.predictions.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Storage("record store lock poisoned".to_string()))
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn resolve_or_create_company(&self, company: NewCompany) -> Result<CompanyId, StoreError> {
        let mut inner = self.lock()?;
        let key = (company.symbol.clone(), company.scope.key());
        if let Some(id) = inner.company_keys.get(&key) {
            return Ok(*id);
        }

        let id = CompanyId::new();
        inner.company_keys.insert(key, id);
        inner.companies.insert(
            id,
            Company {
                id,
                symbol: company.symbol,
                name: company.name,
                sector: company.sector,
                scope: company.scope,
                created_by: company.created_by,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn get_company(&self, id: CompanyId) -> Result<Option<Company>, StoreError> {
        Ok(self.lock()?.companies.get(&id).cloned())
    }

    async fn find_prediction(
        &self,
        company_id: CompanyId,
        period: ReportingPeriod,
        scope: &Scope,
    ) -> Result<Option<Prediction>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .prediction_keys
            .get(&(company_id, period, scope.key()))
            .and_then(|id| inner.predictions.get(id))
            .cloned())
    }

    async fn insert_prediction(&self, prediction: NewPrediction) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.lock()?;
        let key = (prediction.company_id, prediction.period, prediction.scope.key());
        if let Some(existing) = inner.prediction_keys.get(&key).copied() {
            let source = inner.predictions.get(&existing).and_then(|p| p.source);
            return Ok(InsertOutcome::Conflict { existing, source });
        }

        let id = PredictionId::new();
        inner.prediction_keys.insert(key, id);
        inner
            .predictions
            .insert(id, prediction.into_prediction(id, Utc::now()));
        Ok(InsertOutcome::Inserted(id))
    }

    async fn list_predictions(
        &self,
        filter: &ReadFilter,
        query: &PredictionQuery,
    ) -> Result<Vec<Prediction>, StoreError> {
        let inner = self.lock()?;
        let mut visible: Vec<_> = inner
            .predictions
            .values()
            .filter(|p| filter.allows(&p.scope) && query.matches(p))
            .cloned()
            .collect();
        visible.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(visible
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskbatch_core::{
        AnnualRatios, JobId, OrganizationId, RatioInput, RiskScore, RiskTier, SourceRow, UserId,
    };

    fn new_company(symbol: &str, scope: Scope) -> NewCompany {
        NewCompany {
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            sector: None,
            scope,
            created_by: UserId::new(),
        }
    }

    fn new_prediction(company_id: CompanyId, scope: Scope, year: i32) -> NewPrediction {
        NewPrediction {
            company_id,
            scope,
            period: ReportingPeriod::annual(year).unwrap(),
            ratios: RatioInput::Annual(AnnualRatios {
                long_term_debt_to_total_capital: 0.4,
                total_debt_to_ebitda: 2.0,
                net_income_margin: 0.1,
                ebit_to_interest_expense: 6.0,
                return_on_assets: 0.05,
            }),
            score: RiskScore {
                probability: 0.2,
                risk_tier: RiskTier::Low,
                confidence: 0.85,
                members: vec![],
            },
            created_by: UserId::new(),
            source: Some(SourceRow {
                job_id: JobId::new(),
                row_index: 0,
            }),
        }
    }

    #[tokio::test]
    async fn same_symbol_and_scope_resolve_to_one_company() {
        let store = InMemoryRecordStore::new();
        let scope = Scope::Organization {
            organization_id: OrganizationId::new(),
        };
        let a = store
            .resolve_or_create_company(new_company("ACME", scope))
            .await
            .unwrap();
        let b = store
            .resolve_or_create_company(new_company("ACME", scope))
            .await
            .unwrap();
        assert_eq!(a, b);

        let other = store
            .resolve_or_create_company(new_company("ACME", Scope::System))
            .await
            .unwrap();
        assert_ne!(a, other);
        assert_eq!(store.company_count(), 2);
    }

    #[tokio::test]
    async fn second_prediction_for_key_conflicts() {
        let store = InMemoryRecordStore::new();
        let scope = Scope::System;
        let company = store
            .resolve_or_create_company(new_company("ACME", scope))
            .await
            .unwrap();

        let first = new_prediction(company, scope, 2023);
        let source = first.source;
        let InsertOutcome::Inserted(id) = store.insert_prediction(first).await.unwrap() else {
            panic!("first insert must succeed");
        };

        let second = store
            .insert_prediction(new_prediction(company, scope, 2023))
            .await
            .unwrap();
        assert_eq!(
            second,
            InsertOutcome::Conflict {
                existing: id,
                source
            }
        );
        assert_eq!(store.prediction_count(), 1);

        // Different year is a different key.
        assert!(matches!(
            store
                .insert_prediction(new_prediction(company, scope, 2022))
                .await
                .unwrap(),
            InsertOutcome::Inserted(_)
        ));
    }

    #[tokio::test]
    async fn listing_applies_read_filter() {
        let store = InMemoryRecordStore::new();
        let alice = UserId::new();
        let bob = UserId::new();
        let personal = Scope::Personal { owner: alice };
        let company = store
            .resolve_or_create_company(new_company("ACME", personal))
            .await
            .unwrap();
        store
            .insert_prediction(new_prediction(company, personal, 2023))
            .await
            .unwrap();

        let for_alice = ReadFilter::Restricted {
            user_id: alice,
            organization_id: None,
        };
        let for_bob = ReadFilter::Restricted {
            user_id: bob,
            organization_id: None,
        };
        let q = PredictionQuery::default();
        assert_eq!(store.list_predictions(&for_alice, &q).await.unwrap().len(), 1);
        assert!(store.list_predictions(&for_bob, &q).await.unwrap().is_empty());
        assert_eq!(
            store
                .list_predictions(&ReadFilter::Unrestricted, &q)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
