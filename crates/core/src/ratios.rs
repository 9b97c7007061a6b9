//! Fixed financial ratio sets consumed by the scoring models.
//!
//! Field order matters: models are trained against the ordered feature vector
//! returned by `features()`, which follows the `FEATURES` constant of each set.

use serde::{Deserialize, Serialize};

use crate::period::Variant;

/// Ratios scored by the annual model.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualRatios {
    pub long_term_debt_to_total_capital: f64,
    pub total_debt_to_ebitda: f64,
    pub net_income_margin: f64,
    pub ebit_to_interest_expense: f64,
    pub return_on_assets: f64,
}

impl AnnualRatios {
    pub const FEATURES: [&'static str; 5] = [
        "long_term_debt_to_total_capital",
        "total_debt_to_ebitda",
        "net_income_margin",
        "ebit_to_interest_expense",
        "return_on_assets",
    ];

    pub fn features(&self) -> [f64; 5] {
        [
            self.long_term_debt_to_total_capital,
            self.total_debt_to_ebitda,
            self.net_income_margin,
            self.ebit_to_interest_expense,
            self.return_on_assets,
        ]
    }
}

/// Ratios scored by the quarterly ensemble.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarterlyRatios {
    pub total_debt_to_ebitda: f64,
    pub sga_margin: f64,
    pub long_term_debt_to_total_capital: f64,
    pub return_on_capital: f64,
}

impl QuarterlyRatios {
    pub const FEATURES: [&'static str; 4] = [
        "total_debt_to_ebitda",
        "sga_margin",
        "long_term_debt_to_total_capital",
        "return_on_capital",
    ];

    pub fn features(&self) -> [f64; 4] {
        [
            self.total_debt_to_ebitda,
            self.sga_margin,
            self.long_term_debt_to_total_capital,
            self.return_on_capital,
        ]
    }
}

/// Validated ratio input for one record, tagged by variant.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum RatioInput {
    Annual(AnnualRatios),
    Quarterly(QuarterlyRatios),
}

impl RatioInput {
    pub fn variant(&self) -> Variant {
        match self {
            RatioInput::Annual(_) => Variant::Annual,
            RatioInput::Quarterly(_) => Variant::Quarterly,
        }
    }

    /// Feature names, in model order.
    pub fn feature_names(variant: Variant) -> &'static [&'static str] {
        match variant {
            Variant::Annual => &AnnualRatios::FEATURES,
            Variant::Quarterly => &QuarterlyRatios::FEATURES,
        }
    }

    /// Feature vector, in model order.
    pub fn features(&self) -> Vec<f64> {
        match self {
            RatioInput::Annual(r) => r.features().to_vec(),
            RatioInput::Quarterly(r) => r.features().to_vec(),
        }
    }

    /// `(name, value)` pairs, in model order.
    pub fn named_features(&self) -> Vec<(&'static str, f64)> {
        Self::feature_names(self.variant())
            .iter()
            .copied()
            .zip(self.features())
            .collect()
    }
}
