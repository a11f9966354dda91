//! Normalized option quote

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::symbol::OptionSymbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionSide {
    Call,
    Put,
}

impl OptionSide {
    /// Single-letter venue code
    pub fn code(&self) -> &'static str {
        match self {
            OptionSide::Call => "C",
            OptionSide::Put => "P",
        }
    }

    /// Parse either the venue code (`C`/`P`) or the long form (`call`/`put`)
    pub fn from_code(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "C" | "CALL" => Some(OptionSide::Call),
            "P" | "PUT" => Some(OptionSide::Put),
            _ => None,
        }
    }
}

impl fmt::Display for OptionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionSide::Call => write!(f, "Call"),
            OptionSide::Put => write!(f, "Put"),
        }
    }
}

/// One snapshot of one option at one point in time.
///
/// Greeks and implied volatilities are stored exactly as the venue sent them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub symbol: String,
    pub underlying: String,
    pub expiry: String,
    pub strike: f64,
    pub side: OptionSide,
    pub bid_iv: f64,
    pub ask_iv: f64,
    pub mark_iv: f64,
    pub last_price: f64,
    pub mark_price: f64,
    pub underlying_price: f64,
    pub open_interest: f64,
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
    pub volume_24h: f64,
    pub timestamp: DateTime<Utc>,
}

impl QuoteRecord {
    /// Record with all market fields zeroed, identity taken from the symbol
    pub fn for_symbol(symbol: &OptionSymbol, raw: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: crate::symbol::normalize_symbol(raw),
            underlying: symbol.underlying.clone(),
            expiry: symbol.expiry.clone(),
            strike: symbol.strike,
            side: symbol.side,
            bid_iv: 0.0,
            ask_iv: 0.0,
            mark_iv: 0.0,
            last_price: 0.0,
            mark_price: 0.0,
            underlying_price: 0.0,
            open_interest: 0.0,
            delta: 0.0,
            gamma: 0.0,
            vega: 0.0,
            theta: 0.0,
            volume_24h: 0.0,
            timestamp,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    pub fn timestamp_from_ms(ms: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(ms).single()
    }

    /// Reason a store should refuse this row, if any
    pub fn invalid_reason(&self) -> Option<String> {
        if self.symbol.is_empty() {
            return Some("empty symbol".to_string());
        }
        if !self.strike.is_finite() || self.strike <= 0.0 {
            return Some(format!("invalid strike {}", self.strike));
        }
        let numeric = [
            ("bid_iv", self.bid_iv),
            ("ask_iv", self.ask_iv),
            ("mark_iv", self.mark_iv),
            ("last_price", self.last_price),
            ("mark_price", self.mark_price),
            ("underlying_price", self.underlying_price),
            ("open_interest", self.open_interest),
            ("delta", self.delta),
            ("gamma", self.gamma),
            ("vega", self.vega),
            ("theta", self.theta),
            ("volume_24h", self.volume_24h),
        ];
        numeric
            .iter()
            .find(|(_, v)| !v.is_finite())
            .map(|(name, v)| format!("non-finite {}: {}", name, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QuoteRecord {
        let sym = OptionSymbol::parse("BTC-27DEC24-100000-C").unwrap();
        let ts = QuoteRecord::timestamp_from_ms(1_700_000_000_000).unwrap();
        QuoteRecord::for_symbol(&sym, "btc-27dec24-100000-c", ts)
    }

    #[test]
    fn test_for_symbol_identity() {
        let q = sample();
        assert_eq!(q.symbol, "BTC-27DEC24-100000-C");
        assert_eq!(q.underlying, "BTC");
        assert_eq!(q.side, OptionSide::Call);
        assert_eq!(q.timestamp_ms(), 1_700_000_000_000);
    }

    #[test]
    fn test_invalid_reason() {
        let mut q = sample();
        assert!(q.invalid_reason().is_none());
        q.delta = f64::NAN;
        assert_eq!(q.invalid_reason().unwrap(), "non-finite delta: NaN");
    }

    #[test]
    fn test_side_codes() {
        assert_eq!(OptionSide::from_code("c"), Some(OptionSide::Call));
        assert_eq!(OptionSide::from_code("Put"), Some(OptionSide::Put));
        assert_eq!(OptionSide::from_code("x"), None);
        assert_eq!(OptionSide::Put.code(), "P");
        assert_eq!(OptionSide::Call.to_string(), "Call");
    }

    #[test]
    fn test_serde_side_lowercase() {
        let json = serde_json::to_string(&OptionSide::Put).unwrap();
        assert_eq!(json, "\"put\"");
    }
}
