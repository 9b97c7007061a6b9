use serde::{Deserialize, Serialize};

use riskbatch_core::Variant;

use crate::result::ScoringError;

/// A pretrained classifier, consumed as an opaque probability function.
///
/// Implementations must be pure: the same features always yield the same
/// probability, and scoring never mutates the model.
pub trait RiskModel: Send + Sync + 'static {
    /// Model identity (reported alongside member probabilities).
    fn name(&self) -> &str;

    /// The ratio set this model was trained on.
    fn variant(&self) -> Variant;

    /// Probability of default for the ordered feature vector.
    fn predict_proba(&self, features: &[f64]) -> Result<f64, ScoringError>;
}

/// Serialized model artifact, as referenced from the model manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    Logistic(LogisticModel),
}

impl ModelArtifact {
    pub fn into_model(self) -> Result<Box<dyn RiskModel>, ScoringError> {
        match self {
            ModelArtifact::Logistic(m) => {
                m.validate()?;
                Ok(Box::new(m))
            }
        }
    }
}

/// Logistic regression over (optionally standardized) features.
///
/// `p = 1 / (1 + exp(-(intercept + Σ coefficients[i] * z[i])))` where
/// `z[i] = (x[i] - feature_means[i]) / feature_scales[i]` when a scaler is
/// present, else `x[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub name: String,
    pub variant: Variant,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    #[serde(default)]
    pub feature_means: Option<Vec<f64>>,
    #[serde(default)]
    pub feature_scales: Option<Vec<f64>>,
}

impl LogisticModel {
    pub fn new(name: impl Into<String>, variant: Variant, intercept: f64, coefficients: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            variant,
            intercept,
            coefficients,
            feature_means: None,
            feature_scales: None,
        }
    }

    pub fn with_scaler(mut self, means: Vec<f64>, scales: Vec<f64>) -> Self {
        self.feature_means = Some(means);
        self.feature_scales = Some(scales);
        self
    }

    fn expected_features(&self) -> usize {
        riskbatch_core::RatioInput::feature_names(self.variant).len()
    }

    pub fn validate(&self) -> Result<(), ScoringError> {
        let n = self.expected_features();
        if self.coefficients.len() != n {
            return Err(ScoringError::configuration(format!(
                "model '{}' has {} coefficients, {} variant expects {}",
                self.name,
                self.coefficients.len(),
                self.variant,
                n
            )));
        }
        if !self.intercept.is_finite() || self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ScoringError::configuration(format!(
                "model '{}' has non-finite parameters",
                self.name
            )));
        }
        match (&self.feature_means, &self.feature_scales) {
            (None, None) => Ok(()),
            (Some(means), Some(scales)) => {
                if means.len() != n || scales.len() != n {
                    return Err(ScoringError::configuration(format!(
                        "model '{}' scaler length does not match {n} features",
                        self.name
                    )));
                }
                if scales.iter().any(|s| !s.is_finite() || *s == 0.0) {
                    return Err(ScoringError::configuration(format!(
                        "model '{}' has a zero or non-finite feature scale",
                        self.name
                    )));
                }
                Ok(())
            }
            _ => Err(ScoringError::configuration(format!(
                "model '{}' must define both feature_means and feature_scales, or neither",
                self.name
            ))),
        }
    }
}

impl RiskModel for LogisticModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> Variant {
        self.variant
    }

    fn predict_proba(&self, features: &[f64]) -> Result<f64, ScoringError> {
        if features.len() != self.coefficients.len() {
            return Err(ScoringError::inference(format!(
                "model '{}' expects {} features, got {}",
                self.name,
                self.coefficients.len(),
                features.len()
            )));
        }

        let mut logit = self.intercept;
        for (i, (x, c)) in features.iter().zip(&self.coefficients).enumerate() {
            let z = match (&self.feature_means, &self.feature_scales) {
                (Some(means), Some(scales)) => (x - means[i]) / scales[i],
                _ => *x,
            };
            logit += c * z;
        }

        Ok(sigmoid(logit))
    }
}

fn sigmoid(x: f64) -> f64 {
    // Split on sign so neither branch overflows exp().
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_logit_is_even_odds() {
        let m = LogisticModel::new("flat", Variant::Quarterly, 0.0, vec![0.0; 4]);
        let p = m.predict_proba(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!((p - 0.5).abs() < 1e-12);
    }

    #[test]
    fn extreme_logits_stay_in_unit_interval() {
        let m = LogisticModel::new("steep", Variant::Annual, 0.0, vec![1000.0, 0.0, 0.0, 0.0, 0.0]);
        let hi = m.predict_proba(&[10.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        let lo = m.predict_proba(&[-10.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(hi <= 1.0 && hi > 0.99);
        assert!(lo >= 0.0 && lo < 0.01);
    }

    #[test]
    fn scaler_standardizes_features() {
        let m = LogisticModel::new("scaled", Variant::Quarterly, 0.0, vec![1.0, 0.0, 0.0, 0.0])
            .with_scaler(vec![5.0, 0.0, 0.0, 0.0], vec![1.0; 4]);
        let p = m.predict_proba(&[5.0, 9.0, 9.0, 9.0]).unwrap();
        assert!((p - 0.5).abs() < 1e-12);
    }

    #[test]
    fn coefficient_count_must_match_variant() {
        let m = LogisticModel::new("short", Variant::Annual, 0.0, vec![1.0; 4]);
        assert!(matches!(m.validate(), Err(ScoringError::Configuration(_))));
    }

    #[test]
    fn artifact_deserializes_from_tagged_json() {
        let json = r#"{
            "kind": "logistic",
            "name": "annual_v1",
            "variant": "annual",
            "intercept": -1.5,
            "coefficients": [0.1, 0.2, -0.3, -0.01, -0.5]
        }"#;
        let artifact: ModelArtifact = serde_json::from_str(json).unwrap();
        let model = artifact.into_model().unwrap();
        assert_eq!(model.name(), "annual_v1");
        assert_eq!(model.variant(), Variant::Annual);
    }
}
