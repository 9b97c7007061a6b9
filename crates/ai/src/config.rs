//! Scoring configuration: tier thresholds, plausible ratio bounds and the
//! deployment's model manifest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use riskbatch_core::{RatioInput, RiskTier};

use crate::model::ModelArtifact;
use crate::result::{ScoringError, ScoringInputError};

/// Confidence reported when only one model contributes to a score.
pub const DEFAULT_SINGLE_MODEL_CONFIDENCE: f64 = 0.85;

/// Step function from probability to [`RiskTier`].
///
/// `[0, low_max) → LOW`, `[low_max, medium_max) → MEDIUM`,
/// `[medium_max, 1] → HIGH`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub low_max: f64,
    pub medium_max: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low_max: 0.30,
            medium_max: 0.70,
        }
    }
}

impl RiskThresholds {
    pub fn new(low_max: f64, medium_max: f64) -> Result<Self, ScoringError> {
        let t = Self { low_max, medium_max };
        t.validate()?;
        Ok(t)
    }

    pub fn validate(&self) -> Result<(), ScoringError> {
        if !(0.0 < self.low_max && self.low_max < self.medium_max && self.medium_max <= 1.0) {
            return Err(ScoringError::configuration(format!(
                "risk thresholds must satisfy 0 < low_max < medium_max <= 1 (got {} / {})",
                self.low_max, self.medium_max
            )));
        }
        Ok(())
    }

    pub fn tier(&self, probability: f64) -> RiskTier {
        if probability < self.low_max {
            RiskTier::Low
        } else if probability < self.medium_max {
            RiskTier::Medium
        } else {
            RiskTier::High
        }
    }
}

/// Inclusive plausible range for one ratio.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub min: f64,
    pub max: f64,
}

/// Per-feature plausible bounds. Features without an entry only need to be
/// finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RatioBounds(BTreeMap<String, Bound>);

impl Default for RatioBounds {
    fn default() -> Self {
        let mut bounds = BTreeMap::new();
        let mut put = |name: &str, min: f64, max: f64| {
            bounds.insert(name.to_string(), Bound { min, max });
        };
        put("long_term_debt_to_total_capital", -10.0, 10.0);
        put("total_debt_to_ebitda", -1_000.0, 1_000.0);
        put("net_income_margin", -100.0, 100.0);
        put("ebit_to_interest_expense", -10_000.0, 10_000.0);
        put("return_on_assets", -100.0, 100.0);
        put("sga_margin", -100.0, 100.0);
        put("return_on_capital", -100.0, 100.0);
        Self(bounds)
    }
}

impl RatioBounds {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with_bound(mut self, feature: impl Into<String>, min: f64, max: f64) -> Self {
        self.0.insert(feature.into(), Bound { min, max });
        self
    }

    pub fn get(&self, feature: &str) -> Option<Bound> {
        self.0.get(feature).copied()
    }

    /// Reject the first non-finite or out-of-bounds ratio.
    pub fn check(&self, input: &RatioInput) -> Result<(), ScoringInputError> {
        for (name, value) in input.named_features() {
            if !value.is_finite() {
                return Err(ScoringInputError::new(name, value, "value is not finite"));
            }
            if let Some(b) = self.get(name) {
                if value < b.min || value > b.max {
                    return Err(ScoringInputError::new(
                        name,
                        value,
                        format!("outside plausible range [{}, {}]", b.min, b.max),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Non-model scoring knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub thresholds: RiskThresholds,
    #[serde(default)]
    pub bounds: RatioBounds,
    #[serde(default = "default_single_model_confidence")]
    pub single_model_confidence: f64,
}

fn default_single_model_confidence() -> f64 {
    DEFAULT_SINGLE_MODEL_CONFIDENCE
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            bounds: RatioBounds::default(),
            single_model_confidence: DEFAULT_SINGLE_MODEL_CONFIDENCE,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ScoringError> {
        self.thresholds.validate()?;
        if !(0.0..=1.0).contains(&self.single_model_confidence) {
            return Err(ScoringError::configuration(format!(
                "single_model_confidence must be in [0, 1], got {}",
                self.single_model_confidence
            )));
        }
        Ok(())
    }
}

/// Reference to a model artifact: a JSON file (relative paths resolve
/// against the manifest's directory) or an inline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtifactRef {
    Path { path: PathBuf },
    Inline(ModelArtifact),
}

impl ArtifactRef {
    pub fn load(&self, base_dir: &Path) -> Result<ModelArtifact, ScoringError> {
        match self {
            ArtifactRef::Inline(a) => Ok(a.clone()),
            ArtifactRef::Path { path } => {
                let full = if path.is_absolute() {
                    path.clone()
                } else {
                    base_dir.join(path)
                };
                let raw = std::fs::read_to_string(&full).map_err(|e| {
                    ScoringError::configuration(format!("failed to read {}: {e}", full.display()))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    ScoringError::configuration(format!("failed to parse {}: {e}", full.display()))
                })
            }
        }
    }
}

/// One weighted member of the quarterly ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRef {
    pub weight: f64,
    pub model: ArtifactRef,
}

/// Deployment-level description of which models to load and how to combine
/// them.
///
/// ```json
/// {
///   "annual": { "path": "annual_logreg.json" },
///   "quarterly": [
///     { "weight": 0.6, "model": { "path": "quarterly_a.json" } },
///     { "weight": 0.4, "model": { "path": "quarterly_b.json" } }
///   ],
///   "scoring": { "thresholds": { "low_max": 0.3, "medium_max": 0.7 } }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub annual: ArtifactRef,
    pub quarterly: Vec<MemberRef>,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl ModelManifest {
    pub fn from_path(path: &Path) -> Result<Self, ScoringError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ScoringError::configuration(format!("failed to read manifest {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ScoringError::configuration(format!("failed to parse manifest {}: {e}", path.display()))
        })
    }
}
