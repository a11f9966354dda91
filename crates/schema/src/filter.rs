//! Read-side filter over stored quotes

use serde::{Deserialize, Serialize};

use crate::quote::{OptionSide, QuoteRecord};

pub const DEFAULT_READ_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteFilter {
    pub underlying: String,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default)]
    pub side: Option<OptionSide>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_READ_LIMIT
}

impl QuoteFilter {
    pub fn underlying(underlying: &str) -> Self {
        Self {
            underlying: underlying.trim().to_ascii_uppercase(),
            expiry: None,
            side: None,
            limit: DEFAULT_READ_LIMIT,
        }
    }

    pub fn with_expiry(mut self, expiry: &str) -> Self {
        self.expiry = Some(expiry.trim().to_ascii_uppercase());
        self
    }

    pub fn with_side(mut self, side: OptionSide) -> Self {
        self.side = Some(side);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, quote: &QuoteRecord) -> bool {
        if !quote.underlying.eq_ignore_ascii_case(&self.underlying) {
            return false;
        }
        if let Some(expiry) = &self.expiry {
            if !quote.expiry.eq_ignore_ascii_case(expiry) {
                return false;
            }
        }
        if let Some(side) = self.side {
            if quote.side != side {
                return false;
            }
        }
        true
    }

    /// Keep matching quotes, highest 24h volume first, truncated to `limit`
    pub fn apply(&self, quotes: impl IntoIterator<Item = QuoteRecord>) -> Vec<QuoteRecord> {
        let mut out: Vec<QuoteRecord> = quotes.into_iter().filter(|q| self.matches(q)).collect();
        out.sort_by(|a, b| {
            b.volume_24h
                .total_cmp(&a.volume_24h)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        out.truncate(self.limit);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::OptionSymbol;

    fn quote(symbol: &str, volume: f64) -> QuoteRecord {
        let sym = OptionSymbol::parse(symbol).unwrap();
        let ts = QuoteRecord::timestamp_from_ms(1_000).unwrap();
        let mut q = QuoteRecord::for_symbol(&sym, symbol, ts);
        q.volume_24h = volume;
        q
    }

    #[test]
    fn test_apply_filters_and_sorts_by_volume() {
        let quotes = vec![
            quote("BTC-27DEC24-100000-C", 5.0),
            quote("BTC-27DEC24-90000-P", 50.0),
            quote("BTC-3JAN25-100000-C", 20.0),
            quote("ETH-27DEC24-3000-C", 100.0),
        ];

        let all = QuoteFilter::underlying("btc").apply(quotes.clone());
        let symbols: Vec<_> = all.iter().map(|q| q.symbol.as_str()).collect();
        assert_eq!(
            symbols,
            vec![
                "BTC-27DEC24-90000-P",
                "BTC-3JAN25-100000-C",
                "BTC-27DEC24-100000-C"
            ]
        );

        let calls = QuoteFilter::underlying("BTC")
            .with_expiry("27dec24")
            .with_side(OptionSide::Call)
            .apply(quotes.clone());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].symbol, "BTC-27DEC24-100000-C");

        let limited = QuoteFilter::underlying("BTC").with_limit(1).apply(quotes);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].volume_24h, 50.0);
    }

    #[test]
    fn test_default_limit_from_json() {
        let f: QuoteFilter = serde_json::from_str(r#"{"underlying":"ETH"}"#).unwrap();
        assert_eq!(f.limit, DEFAULT_READ_LIMIT);
        assert!(f.expiry.is_none());
    }
}
