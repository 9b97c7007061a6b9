//! Infrastructure layer: job orchestration, row processing, storage and
//! configuration.

pub mod company;
pub mod config;
pub mod jobs;
pub mod postgres;
pub mod retry;
pub mod rows;
pub mod store;

#[cfg(test)]
mod testing;

pub use company::{CompanyDetails, CompanyResolver, ResolveError, normalize_symbol};
pub use config::{ConfigError, EngineConfig, OrchestratorConfig};
pub use jobs::{JobOrchestrator, JobStore, OrchestratorHandle};
pub use postgres::{PostgresJobStore, PostgresRecordStore, ensure_schema};
pub use rows::{RawRow, RowOutcome, RowProcessor};
pub use store::{InMemoryRecordStore, RecordStore, StoreError};
