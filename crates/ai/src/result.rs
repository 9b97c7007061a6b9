use thiserror::Error;

/// A ratio the scoring adapter refuses to score.
///
/// The adapter never clamps: a non-finite or implausible ratio fails the
/// record instead.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("ratio '{feature}' = {value} rejected: {reason}")]
pub struct ScoringInputError {
    pub feature: String,
    pub value: f64,
    pub reason: String,
}

impl ScoringInputError {
    pub fn new(feature: impl Into<String>, value: f64, reason: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            value,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoringError {
    #[error("invalid scoring input: {0}")]
    Input(#[from] ScoringInputError),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("model configuration error: {0}")]
    Configuration(String),
}

impl ScoringError {
    pub fn inference(msg: impl Into<String>) -> Self {
        Self::InferenceFailed(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
