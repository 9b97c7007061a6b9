//! `riskbatch-worker`: process wiring for the bulk prediction engine.
//!
//! Picks the storage backend from configuration, loads the models once and
//! hands both to a [`JobOrchestrator`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use riskbatch_ai::ScoringAdapter;
use riskbatch_infra::jobs::InMemoryJobStore;
use riskbatch_infra::{
    EngineConfig, InMemoryRecordStore, JobOrchestrator, JobStore, PostgresJobStore, PostgresRecordStore,
    RecordStore, ensure_schema,
};

/// Storage backends shared by intake and the worker loop.
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub records: Arc<dyn RecordStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            jobs: InMemoryJobStore::arc(),
            records: InMemoryRecordStore::arc(),
        }
    }

    /// Connect to Postgres and apply the schema.
    pub async fn postgres(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("failed to connect to postgres")?;
        ensure_schema(&pool).await.context("failed to apply schema")?;
        Ok(Self {
            jobs: Arc::new(PostgresJobStore::new(pool.clone())),
            records: Arc::new(PostgresRecordStore::new(pool)),
        })
    }
}

/// Build the orchestrator described by `config`.
pub async fn build(config: &EngineConfig) -> anyhow::Result<Arc<JobOrchestrator>> {
    let stores = match &config.database_url {
        Some(url) => {
            let o = &config.orchestrator;
            // One connection per chunk task plus claim/heartbeat traffic.
            let connections = (o.max_concurrent_jobs * (o.workers_per_job + 2)).max(4);
            Stores::postgres(url, u32::try_from(connections).unwrap_or(u32::MAX)).await?
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory stores");
            Stores::in_memory()
        }
    };

    let scoring = ScoringAdapter::from_manifest_path(&config.model_manifest)
        .with_context(|| format!("failed to load models from {}", config.model_manifest.display()))?;
    info!(manifest = %config.model_manifest.display(), "models loaded");

    let orchestrator = JobOrchestrator::new(
        stores.jobs,
        stores.records,
        Arc::new(scoring),
        config.orchestrator.clone(),
    )
    .context("invalid orchestrator settings")?;
    Ok(Arc::new(orchestrator))
}
