//! Persisted records created by bulk jobs: companies and predictions.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{CompanyId, JobId, OrganizationId, PredictionId, UserId};
use crate::period::{ReportingPeriod, Variant};
use crate::ratios::RatioInput;
use crate::scope::Scope;

/// Discrete risk bucket derived from a default probability.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "LOW",
            RiskTier::Medium => "MEDIUM",
            RiskTier::High => "HIGH",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(RiskTier::Low),
            "MEDIUM" => Ok(RiskTier::Medium),
            "HIGH" => Ok(RiskTier::High),
            other => Err(DomainError::validation(format!("unknown risk tier '{other}'"))),
        }
    }
}

/// Probability emitted by one ensemble member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberProbability {
    pub model: String,
    pub probability: f64,
}

/// Ensemble verdict for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    /// Ensemble probability of default, in `[0, 1]`.
    pub probability: f64,
    pub risk_tier: RiskTier,
    /// Agreement between members, in `[0, 1]`.
    pub confidence: f64,
    /// Individual member outputs (a single entry for the annual model).
    pub members: Vec<MemberProbability>,
}

/// A company as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    /// Normalized (trimmed, upper-case) ticker symbol.
    pub symbol: String,
    pub name: String,
    pub sector: Option<String>,
    pub scope: Scope,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Insert request for a company; used only when no company exists for
/// `(symbol, scope)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCompany {
    pub symbol: String,
    pub name: String,
    pub sector: Option<String>,
    pub scope: Scope,
    pub created_by: UserId,
}

/// The job row a prediction was created from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRow {
    pub job_id: JobId,
    pub row_index: usize,
}

/// A scored prediction as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: PredictionId,
    pub company_id: CompanyId,
    pub organization_id: Option<OrganizationId>,
    pub scope: Scope,
    pub period: ReportingPeriod,
    pub ratios: RatioInput,
    pub score: RiskScore,
    pub created_by: UserId,
    /// Set when a bulk job created the prediction.
    pub source: Option<SourceRow>,
    pub created_at: DateTime<Utc>,
}

impl Prediction {
    pub fn variant(&self) -> Variant {
        self.ratios.variant()
    }

    pub fn source_job_id(&self) -> Option<JobId> {
        self.source.map(|s| s.job_id)
    }
}

/// Insert request for a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPrediction {
    pub company_id: CompanyId,
    pub scope: Scope,
    pub period: ReportingPeriod,
    pub ratios: RatioInput,
    pub score: RiskScore,
    pub created_by: UserId,
    pub source: Option<SourceRow>,
}

impl NewPrediction {
    pub fn into_prediction(self, id: PredictionId, created_at: DateTime<Utc>) -> Prediction {
        Prediction {
            id,
            company_id: self.company_id,
            organization_id: self.scope.organization_id(),
            scope: self.scope,
            period: self.period,
            ratios: self.ratios,
            score: self.score,
            created_by: self.created_by,
            source: self.source,
            created_at,
        }
    }
}
