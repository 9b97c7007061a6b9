//! Prediction variants and reporting periods.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Earliest reporting year accepted from a batch row.
pub const MIN_REPORTING_YEAR: i32 = 1900;
/// Latest reporting year accepted from a batch row.
pub const MAX_REPORTING_YEAR: i32 = 2100;

/// Which model family a record is scored with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Annual,
    Quarterly,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Annual => "annual",
            Variant::Quarterly => "quarterly",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "annual" => Ok(Variant::Annual),
            "quarterly" => Ok(Variant::Quarterly),
            other => Err(DomainError::validation(format!("unknown variant '{other}'"))),
        }
    }
}

/// Reporting period of a prediction: a fiscal year, plus a quarter for the
/// quarterly variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportingPeriod {
    pub year: i32,
    pub quarter: Option<u8>,
}

impl ReportingPeriod {
    pub fn annual(year: i32) -> DomainResult<Self> {
        check_year(year)?;
        Ok(Self { year, quarter: None })
    }

    pub fn quarterly(year: i32, quarter: u8) -> DomainResult<Self> {
        check_year(year)?;
        if !(1..=4).contains(&quarter) {
            return Err(DomainError::validation(format!(
                "quarter must be between 1 and 4, got {quarter}"
            )));
        }
        Ok(Self {
            year,
            quarter: Some(quarter),
        })
    }

    pub fn variant(&self) -> Variant {
        if self.quarter.is_some() {
            Variant::Quarterly
        } else {
            Variant::Annual
        }
    }
}

impl fmt::Display for ReportingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.quarter {
            Some(q) => write!(f, "{}-Q{}", self.year, q),
            None => write!(f, "{}", self.year),
        }
    }
}

fn check_year(year: i32) -> DomainResult<()> {
    if !(MIN_REPORTING_YEAR..=MAX_REPORTING_YEAR).contains(&year) {
        return Err(DomainError::validation(format!(
            "reporting year must be between {MIN_REPORTING_YEAR} and {MAX_REPORTING_YEAR}, got {year}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarter_out_of_range_is_rejected() {
        assert!(ReportingPeriod::quarterly(2023, 0).is_err());
        assert!(ReportingPeriod::quarterly(2023, 5).is_err());
        assert_eq!(
            ReportingPeriod::quarterly(2023, 4).unwrap().to_string(),
            "2023-Q4"
        );
    }

    #[test]
    fn year_bounds_apply_to_both_variants() {
        assert!(ReportingPeriod::annual(1899).is_err());
        assert!(ReportingPeriod::quarterly(2101, 1).is_err());
        assert_eq!(ReportingPeriod::annual(2024).unwrap().variant(), Variant::Annual);
    }

    #[test]
    fn variant_parses_case_insensitively() {
        assert_eq!(" Quarterly ".parse::<Variant>().unwrap(), Variant::Quarterly);
        assert!("monthly".parse::<Variant>().is_err());
    }
}
