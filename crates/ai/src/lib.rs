//! `riskbatch-ai`
//!
//! **Responsibility:** scoring boundary around pretrained risk models.
//!
//! - Models are opaque probability functions loaded once at startup.
//! - This crate never persists anything; it returns a [`RiskScore`] for a
//!   validated ratio set.
//!
//! [`RiskScore`]: riskbatch_core::RiskScore

pub mod adapter;
pub mod config;
pub mod model;
pub mod result;

pub use adapter::{EnsembleMember, ScoringAdapter, ensemble_confidence};
pub use config::{ModelManifest, RatioBounds, RiskThresholds, ScoringConfig};
pub use model::{LogisticModel, ModelArtifact, RiskModel};
pub use result::{ScoringError, ScoringInputError};
