//! `riskbatch-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, visibility scopes, reporting periods, ratio sets and the
//! persisted company/prediction records.

pub mod error;
pub mod id;
pub mod period;
pub mod ratios;
pub mod record;
pub mod scope;

pub use error::{DomainError, DomainResult};
pub use id::{CompanyId, JobId, OrganizationId, PredictionId, UserId};
pub use period::{ReportingPeriod, Variant};
pub use ratios::{AnnualRatios, QuarterlyRatios, RatioInput};
pub use record::{
    Company, MemberProbability, NewCompany, NewPrediction, Prediction, RiskScore, RiskTier,
    SourceRow,
};
pub use scope::Scope;
