use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info};

use riskbatch_core::{MemberProbability, RatioInput, RiskScore, Variant};

use crate::config::{ModelManifest, ScoringConfig};
use crate::model::RiskModel;
use crate::result::ScoringError;

/// Tolerance when checking that ensemble weights sum to one.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// One weighted model of the quarterly ensemble.
#[derive(Clone)]
pub struct EnsembleMember {
    pub weight: f64,
    pub model: Arc<dyn RiskModel>,
}

impl EnsembleMember {
    pub fn new(weight: f64, model: impl RiskModel) -> Self {
        Self {
            weight,
            model: Arc::new(model),
        }
    }
}

impl core::fmt::Debug for EnsembleMember {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EnsembleMember")
            .field("weight", &self.weight)
            .field("model", &self.model.name())
            .finish()
    }
}

/// Produces one ensemble verdict per record.
///
/// Constructed once at startup and shared by reference (`Arc`) with every
/// worker; there is no process-global model cache.
///
/// Model:
/// - ANNUAL: the single annual model's probability is used directly.
/// - QUARTERLY: fixed weighted average of the members' probabilities.
/// - Confidence: `1 - max pairwise |p_i - p_j|` over the contributing models,
///   or `single_model_confidence` when only one model contributes.
pub struct ScoringAdapter {
    annual: Arc<dyn RiskModel>,
    quarterly: Vec<EnsembleMember>,
    config: ScoringConfig,
}

impl core::fmt::Debug for ScoringAdapter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScoringAdapter")
            .field("annual", &self.annual.name())
            .field("quarterly", &self.quarterly)
            .field("config", &self.config)
            .finish()
    }
}

impl ScoringAdapter {
    pub fn new(
        annual: Arc<dyn RiskModel>,
        quarterly: Vec<EnsembleMember>,
        config: ScoringConfig,
    ) -> Result<Self, ScoringError> {
        config.validate()?;

        if annual.variant() != Variant::Annual {
            return Err(ScoringError::configuration(format!(
                "annual slot holds a {} model ('{}')",
                annual.variant(),
                annual.name()
            )));
        }

        if quarterly.is_empty() {
            return Err(ScoringError::configuration(
                "quarterly ensemble needs at least one member",
            ));
        }

        let mut weight_sum = 0.0;
        for m in &quarterly {
            if m.model.variant() != Variant::Quarterly {
                return Err(ScoringError::configuration(format!(
                    "quarterly ensemble member '{}' is a {} model",
                    m.model.name(),
                    m.model.variant()
                )));
            }
            if !(m.weight.is_finite() && m.weight >= 0.0) {
                return Err(ScoringError::configuration(format!(
                    "ensemble weight for '{}' must be a finite non-negative number",
                    m.model.name()
                )));
            }
            weight_sum += m.weight;
        }
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ScoringError::configuration(format!(
                "quarterly ensemble weights must sum to 1, got {weight_sum}"
            )));
        }

        Ok(Self {
            annual,
            quarterly,
            config,
        })
    }

    /// Load every model named by the manifest at `path`.
    pub fn from_manifest_path(path: &Path) -> Result<Self, ScoringError> {
        let manifest = ModelManifest::from_path(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_manifest(manifest, base_dir)
    }

    pub fn from_manifest(manifest: ModelManifest, base_dir: &Path) -> Result<Self, ScoringError> {
        let annual: Arc<dyn RiskModel> = Arc::from(manifest.annual.load(base_dir)?.into_model()?);

        let mut quarterly = Vec::with_capacity(manifest.quarterly.len());
        for member in &manifest.quarterly {
            let model: Arc<dyn RiskModel> = Arc::from(member.model.load(base_dir)?.into_model()?);
            quarterly.push(EnsembleMember {
                weight: member.weight,
                model,
            });
        }

        let adapter = Self::new(annual, quarterly, manifest.scoring)?;
        info!(
            annual = adapter.annual.name(),
            quarterly_members = adapter.quarterly.len(),
            low_max = adapter.config.thresholds.low_max,
            medium_max = adapter.config.thresholds.medium_max,
            "scoring models loaded"
        );
        Ok(adapter)
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score one validated record.
    ///
    /// Fails fast with [`ScoringError::Input`] on an implausible ratio; never
    /// clamps inputs.
    pub fn score(&self, input: &RatioInput) -> Result<RiskScore, ScoringError> {
        self.config.bounds.check(input)?;
        let features = input.features();

        let (probability, members) = match input.variant() {
            Variant::Annual => {
                let p = predict(self.annual.as_ref(), &features)?;
                (p, vec![member(self.annual.as_ref(), p)])
            }
            Variant::Quarterly => {
                let mut weighted = 0.0;
                let mut members = Vec::with_capacity(self.quarterly.len());
                for m in &self.quarterly {
                    let p = predict(m.model.as_ref(), &features)?;
                    weighted += m.weight * p;
                    members.push(member(m.model.as_ref(), p));
                }
                (weighted.clamp(0.0, 1.0), members)
            }
        };

        let probabilities: Vec<f64> = members.iter().map(|m| m.probability).collect();
        let confidence = ensemble_confidence(&probabilities, self.config.single_model_confidence);
        let risk_tier = self.config.thresholds.tier(probability);

        debug!(
            variant = %input.variant(),
            probability,
            confidence,
            tier = %risk_tier,
            "record scored"
        );

        Ok(RiskScore {
            probability,
            risk_tier,
            confidence,
            members,
        })
    }
}

/// `1 - max(|p_i - p_j|)` over all pairs; `single_model_default` for fewer
/// than two probabilities.
pub fn ensemble_confidence(probabilities: &[f64], single_model_default: f64) -> f64 {
    if probabilities.len() < 2 {
        return single_model_default;
    }
    // The widest pair is always (min, max).
    let (lo, hi) = probabilities
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(*p), hi.max(*p))
        });
    (1.0 - (hi - lo)).clamp(0.0, 1.0)
}

/// Run one model. A panicking model fails this input only.
fn predict(model: &dyn RiskModel, features: &[f64]) -> Result<f64, ScoringError> {
    let p = match catch_unwind(AssertUnwindSafe(|| model.predict_proba(features))) {
        Ok(result) => result?,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(model = model.name(), %reason, "model panicked");
            return Err(ScoringError::inference(format!("model '{}' panicked: {reason}", model.name())));
        }
    };
    if !(p.is_finite() && (0.0..=1.0).contains(&p)) {
        return Err(ScoringError::inference(format!(
            "model '{}' returned probability {p} outside [0, 1]",
            model.name()
        )));
    }
    Ok(p)
}

fn member(model: &dyn RiskModel, probability: f64) -> MemberProbability {
    MemberProbability {
        model: model.name().to_string(),
        probability,
    }
}
