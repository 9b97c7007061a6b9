//! Decoding loosely-typed spreadsheet rows into typed, validated records.
//!
//! Keys are matched case-insensitively with spaces and hyphens folded to
//! underscores, so `Reporting Year` and `reporting_year` are the same field.
//! Numeric cells may arrive as JSON numbers or as strings (thousands
//! separators allowed); empty strings count as missing.

use std::collections::HashMap;

use serde_json::Value;

use riskbatch_ai::{RatioBounds, ScoringInputError};
use riskbatch_core::{AnnualRatios, DomainError, QuarterlyRatios, RatioInput, ReportingPeriod, Variant};

use crate::company::normalize_symbol;

/// A decoded row as handed over by the CSV/Excel reader.
pub type RawRow = serde_json::Map<String, Value>;

const SYMBOL: &[&str] = &["company_symbol", "symbol", "ticker"];
const NAME: &[&str] = &["company_name", "name"];
const SECTOR: &[&str] = &["sector", "industry"];
const YEAR: &[&str] = &["reporting_year", "year"];
const QUARTER: &[&str] = &["reporting_quarter", "quarter"];

/// Why a row could not be turned into a [`ParsedRow`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RowParseError {
    #[error("missing required field(s): {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("field '{field}' is invalid: {reason}")]
    Invalid { field: String, reason: String },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    OutOfBounds(#[from] ScoringInputError),
}

impl RowParseError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// A validated row, ready for company resolution and scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    /// Normalized symbol.
    pub symbol: String,
    pub company_name: Option<String>,
    pub sector: Option<String>,
    pub period: ReportingPeriod,
    pub ratios: RatioInput,
}

/// Parse `raw` as a `kind` row and check every ratio against `bounds`.
pub fn parse_row(kind: Variant, raw: &RawRow, bounds: &RatioBounds) -> Result<ParsedRow, RowParseError> {
    let mut fields = Fields::new(raw);

    let symbol = fields.text(SYMBOL, true)?;
    let company_name = fields.text(NAME, false)?;
    let sector = fields.text(SECTOR, false)?;
    let year = fields.year()?;
    let quarter = match kind {
        Variant::Annual => None,
        Variant::Quarterly => fields.quarter()?,
    };

    let ratios = match kind {
        Variant::Annual => RatioInput::Annual(AnnualRatios {
            long_term_debt_to_total_capital: fields.ratio("long_term_debt_to_total_capital")?,
            total_debt_to_ebitda: fields.ratio("total_debt_to_ebitda")?,
            net_income_margin: fields.ratio("net_income_margin")?,
            ebit_to_interest_expense: fields.ratio("ebit_to_interest_expense")?,
            return_on_assets: fields.ratio("return_on_assets")?,
        }),
        Variant::Quarterly => RatioInput::Quarterly(QuarterlyRatios {
            total_debt_to_ebitda: fields.ratio("total_debt_to_ebitda")?,
            sga_margin: fields.ratio("sga_margin")?,
            long_term_debt_to_total_capital: fields.ratio("long_term_debt_to_total_capital")?,
            return_on_capital: fields.ratio("return_on_capital")?,
        }),
    };

    if !fields.missing.is_empty() {
        return Err(RowParseError::Missing(fields.missing));
    }

    // Missing fields were reported above, so these are present.
    let symbol = normalize_symbol(symbol.as_deref().unwrap_or_default())?;
    let year = year.unwrap_or_default();
    let period = match quarter {
        Some(q) => ReportingPeriod::quarterly(year, q)?,
        None => ReportingPeriod::annual(year)?,
    };
    bounds.check(&ratios)?;

    Ok(ParsedRow {
        symbol,
        company_name,
        sector,
        period,
        ratios,
    })
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

struct Fields<'a> {
    values: HashMap<String, &'a Value>,
    missing: Vec<String>,
}

impl<'a> Fields<'a> {
    fn new(raw: &'a RawRow) -> Self {
        Self {
            values: raw.iter().map(|(k, v)| (normalize_key(k), v)).collect(),
            missing: Vec::new(),
        }
    }

    fn find(&self, names: &[&'static str]) -> Option<(&'static str, &'a Value)> {
        names.iter().find_map(|name| {
            self.values
                .get(*name)
                .copied()
                .filter(|v| !is_blank(v))
                .map(|v| (*name, v))
        })
    }

    fn require(&mut self, names: &[&'static str]) -> Option<(&'static str, &'a Value)> {
        let found = self.find(names);
        if found.is_none() {
            self.missing.push(names[0].to_string());
        }
        found
    }

    fn text(&mut self, names: &[&'static str], required: bool) -> Result<Option<String>, RowParseError> {
        let found = if required {
            self.require(names)
        } else {
            self.find(names)
        };
        let Some((field, value)) = found else {
            return Ok(None);
        };
        match value {
            Value::String(s) => Ok(Some(s.trim().to_string())),
            Value::Number(n) => Ok(Some(match n.as_i64() {
                Some(i) => i.to_string(),
                None => n
                    .as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 1e15)
                    .map(|f| (f as i64).to_string())
                    .unwrap_or_else(|| n.to_string()),
            })),
            other => Err(RowParseError::invalid(field, format!("expected text, got {other}"))),
        }
    }

    fn ratio(&mut self, name: &'static str) -> Result<f64, RowParseError> {
        match self.require(&[name]) {
            None => Ok(f64::NAN),
            Some((field, value)) => number(field, value),
        }
    }

    fn year(&mut self) -> Result<Option<i32>, RowParseError> {
        let Some((field, value)) = self.require(YEAR) else {
            return Ok(None);
        };
        let n = number(field, value)?;
        if n.fract() != 0.0 || n < i32::MIN as f64 || n > i32::MAX as f64 {
            return Err(RowParseError::invalid(field, format!("{n} is not a whole year")));
        }
        Ok(Some(n as i32))
    }

    fn quarter(&mut self) -> Result<Option<u8>, RowParseError> {
        let Some((field, value)) = self.require(QUARTER) else {
            return Ok(None);
        };
        let n = match value {
            Value::String(s) => {
                let s = s.trim();
                let digits = s
                    .strip_prefix('Q')
                    .or_else(|| s.strip_prefix('q'))
                    .unwrap_or(s);
                digits
                    .parse::<f64>()
                    .map_err(|_| RowParseError::invalid(field, format!("'{s}' is not a quarter")))?
            }
            other => number(field, other)?,
        };
        if n.fract() != 0.0 || !(1.0..=4.0).contains(&n) {
            return Err(RowParseError::invalid(field, format!("quarter must be 1-4, got {n}")));
        }
        Ok(Some(n as u8))
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn number(field: &str, value: &Value) -> Result<f64, RowParseError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| RowParseError::invalid(field, format!("{n} is not representable"))),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            cleaned
                .parse::<f64>()
                .map_err(|_| RowParseError::invalid(field, format!("'{}' is not a number", s.trim())))
        }
        other => Err(RowParseError::invalid(field, format!("expected a number, got {other}"))),
    }
}
