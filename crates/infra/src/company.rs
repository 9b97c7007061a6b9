//! Company resolution: `(symbol, scope)` → company id, creating on first use.

use std::sync::Arc;

use tracing::debug;

use riskbatch_core::{CompanyId, DomainError, NewCompany, Scope, UserId};

use crate::store::{RecordStore, StoreError};

/// Longest accepted ticker symbol, after normalization.
pub const MAX_SYMBOL_LEN: usize = 16;

/// Trim and upper-case a ticker symbol.
///
/// Symbols are `A-Z`, `0-9` and `.`, `-`, `^`, `/`; internal whitespace is
/// rejected rather than collapsed.
pub fn normalize_symbol(raw: &str) -> Result<String, DomainError> {
    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(DomainError::validation("company symbol is empty"));
    }
    if symbol.chars().count() > MAX_SYMBOL_LEN {
        return Err(DomainError::validation(format!(
            "company symbol '{symbol}' is longer than {MAX_SYMBOL_LEN} characters"
        )));
    }
    if let Some(bad) = symbol
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '/')))
    {
        return Err(DomainError::validation(format!(
            "company symbol '{symbol}' contains invalid character {bad:?}"
        )));
    }
    Ok(symbol)
}

/// Error from [`CompanyResolver::resolve_or_create`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    InvalidSymbol(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Descriptive fields used only when the company has to be created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompanyDetails {
    pub name: Option<String>,
    pub sector: Option<String>,
}

/// Resolves companies against the record store.
#[derive(Clone)]
pub struct CompanyResolver {
    records: Arc<dyn RecordStore>,
}

impl CompanyResolver {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Id of the company keyed by `(normalize(symbol), scope)`.
    ///
    /// Concurrent calls with the same key return the same id; existing
    /// companies are never modified (a differing `details` is ignored).
    pub async fn resolve_or_create(
        &self,
        symbol: &str,
        scope: Scope,
        created_by: UserId,
        details: CompanyDetails,
    ) -> Result<CompanyId, ResolveError> {
        let symbol = normalize_symbol(symbol)?;
        let name = details
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| symbol.clone());
        let sector = details
            .sector
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let id = self
            .records
            .resolve_or_create_company(NewCompany {
                symbol: symbol.clone(),
                name,
                sector,
                scope,
                created_by,
            })
            .await?;
        debug!(%symbol, scope = %scope.key(), company_id = %id, "company resolved");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRecordStore;
    use proptest::prelude::*;
    use riskbatch_core::OrganizationId;

    #[test]
    fn symbols_are_trimmed_and_upper_cased() {
        assert_eq!(normalize_symbol("  brk.b ").unwrap(), "BRK.B");
        assert_eq!(normalize_symbol("7203").unwrap(), "7203");
    }

    #[test]
    fn bad_symbols_are_rejected() {
        assert!(normalize_symbol("   ").is_err());
        assert!(normalize_symbol("AC ME").is_err());
        assert!(normalize_symbol("ACME;DROP").is_err());
        assert!(normalize_symbol(&"X".repeat(MAX_SYMBOL_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn resolution_is_idempotent_across_spellings() {
        let store = InMemoryRecordStore::arc();
        let resolver = CompanyResolver::new(store.clone());
        let scope = Scope::Organization {
            organization_id: OrganizationId::new(),
        };
        let user = UserId::new();

        let a = resolver
            .resolve_or_create("acme", scope, user, CompanyDetails::default())
            .await
            .unwrap();
        let b = resolver
            .resolve_or_create(
                " ACME ",
                scope,
                user,
                CompanyDetails {
                    name: Some("Acme Corp".to_string()),
                    sector: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(a, b);

        let company = store.get_company(a).await.unwrap().unwrap();
        assert_eq!(company.name, "ACME");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_resolution_yields_one_company() {
        let store = InMemoryRecordStore::arc();
        let resolver = CompanyResolver::new(store.clone());
        let scope = Scope::System;
        let user = UserId::new();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver
                    .resolve_or_create("ACME", scope, user, CompanyDetails::default())
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.company_count(), 1);
    }

    proptest! {
        /// Property: normalization is idempotent and only ever yields
        /// upper-case symbols within the length limit.
        #[test]
        fn normalization_is_idempotent(raw in "[ a-zA-Z0-9.^/-]{0,20}") {
            if let Ok(symbol) = normalize_symbol(&raw) {
                prop_assert_eq!(normalize_symbol(&symbol), Ok(symbol.clone()));
                prop_assert!(symbol.chars().count() <= MAX_SYMBOL_LEN);
                prop_assert_eq!(symbol.to_uppercase(), symbol);
            }
        }
    }
}
