//! Option symbol grammar
//!
//! Venue symbols look like `BTC-27DEC24-100000-C` (inverse options) or
//! `BTC-27DEC24-100000-C-USDT` (USDT-settled). Identifiers are compared
//! upper-cased everywhere in the pipeline.

use chrono::NaiveDate;
use thiserror::Error;

use crate::quote::OptionSide;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SymbolError {
    #[error("empty symbol")]
    Empty,
    #[error("symbol {0} does not have BASE-EXPIRY-STRIKE-SIDE segments")]
    Segments(String),
    #[error("symbol {symbol} has invalid strike {strike}")]
    Strike { symbol: String, strike: String },
    #[error("symbol {symbol} has invalid side {side}")]
    Side { symbol: String, side: String },
}

/// Canonical form of a venue identifier
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

/// Calendar date of a venue expiry code such as `27DEC24`
pub fn expiry_date(code: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(code.trim(), "%d%b%y").ok()
}

/// Sort expiry codes chronologically; codes that do not parse go last, lexically
pub fn sort_expiries(codes: &mut [String]) {
    codes.sort_by(|a, b| match (expiry_date(a), expiry_date(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.cmp(b),
    });
}

/// Parsed components of an option symbol
#[derive(Debug, Clone, PartialEq)]
pub struct OptionSymbol {
    pub underlying: String,
    pub expiry: String,
    pub strike: f64,
    pub side: OptionSide,
    /// Settlement coin suffix (`USDT`), absent for inverse options
    pub settle: Option<String>,
}

impl OptionSymbol {
    pub fn parse(symbol: &str) -> Result<Self, SymbolError> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(SymbolError::Empty);
        }

        let parts: Vec<&str> = symbol.split('-').collect();
        if parts.len() != 4 && parts.len() != 5 {
            return Err(SymbolError::Segments(symbol));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(SymbolError::Segments(symbol));
        }

        let strike: f64 = parts[2].parse().map_err(|_| SymbolError::Strike {
            symbol: symbol.clone(),
            strike: parts[2].to_string(),
        })?;
        if !strike.is_finite() || strike <= 0.0 {
            return Err(SymbolError::Strike {
                symbol: symbol.clone(),
                strike: parts[2].to_string(),
            });
        }

        let side = match parts[3] {
            "C" => OptionSide::Call,
            "P" => OptionSide::Put,
            other => {
                return Err(SymbolError::Side {
                    symbol: symbol.clone(),
                    side: other.to_string(),
                })
            }
        };

        Ok(Self {
            underlying: parts[0].to_string(),
            expiry: parts[1].to_string(),
            strike,
            side,
            settle: parts.get(4).map(|s| s.to_string()),
        })
    }
}
