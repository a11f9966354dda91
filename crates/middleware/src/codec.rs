//! Flat string-map encoding of a quote, as stored in a Redis hash
//!
//! Field names match the layout the dashboard reads: `option:{SYMBOL}` with
//! `type` holding `Call`/`Put` and `timestamp` in epoch milliseconds.

use std::collections::HashMap;

use optfeed_schema::{OptionSide, QuoteRecord};

pub const QUOTE_KEY_PREFIX: &str = "option:";
pub const INDEX_KEY_PREFIX: &str = "option-index:";
pub const STATS_KEY: &str = "stats:global";

pub fn quote_key(symbol: &str) -> String {
    format!("{}{}", QUOTE_KEY_PREFIX, symbol)
}

pub fn index_key(underlying: &str) -> String {
    format!("{}{}", INDEX_KEY_PREFIX, underlying.to_ascii_uppercase())
}

pub fn to_fields(q: &QuoteRecord) -> Vec<(&'static str, String)> {
    vec![
        ("symbol", q.symbol.clone()),
        ("underlying", q.underlying.clone()),
        ("expiry", q.expiry.clone()),
        ("strike", q.strike.to_string()),
        ("type", q.side.to_string()),
        ("last_price", q.last_price.to_string()),
        ("mark_price", q.mark_price.to_string()),
        ("volume_24h", q.volume_24h.to_string()),
        ("open_interest", q.open_interest.to_string()),
        ("delta", q.delta.to_string()),
        ("gamma", q.gamma.to_string()),
        ("theta", q.theta.to_string()),
        ("vega", q.vega.to_string()),
        ("bid_iv", q.bid_iv.to_string()),
        ("ask_iv", q.ask_iv.to_string()),
        ("mark_iv", q.mark_iv.to_string()),
        ("underlying_price", q.underlying_price.to_string()),
        ("timestamp", q.timestamp_ms().to_string()),
    ]
}

fn text(fields: &HashMap<String, String>, name: &str) -> Result<String, String> {
    fields
        .get(name)
        .cloned()
        .ok_or_else(|| format!("missing field {}", name))
}

fn number(fields: &HashMap<String, String>, name: &str) -> Result<f64, String> {
    match fields.get(name) {
        // Older writers left absent values as empty strings
        None => Ok(0.0),
        Some(v) if v.is_empty() => Ok(0.0),
        Some(v) => v
            .parse()
            .map_err(|_| format!("field {} is not a number: {}", name, v)),
    }
}

pub fn from_fields(fields: &HashMap<String, String>) -> Result<QuoteRecord, String> {
    let side_raw = text(fields, "type")?;
    let side = OptionSide::from_code(&side_raw).ok_or_else(|| format!("bad type {}", side_raw))?;
    let ts_raw = text(fields, "timestamp")?;
    let ts_ms: i64 = ts_raw
        .parse()
        .map_err(|_| format!("bad timestamp {}", ts_raw))?;
    let timestamp =
        QuoteRecord::timestamp_from_ms(ts_ms).ok_or_else(|| format!("bad timestamp {}", ts_ms))?;

    Ok(QuoteRecord {
        symbol: text(fields, "symbol")?,
        underlying: text(fields, "underlying")?,
        expiry: text(fields, "expiry")?,
        strike: number(fields, "strike")?,
        side,
        bid_iv: number(fields, "bid_iv")?,
        ask_iv: number(fields, "ask_iv")?,
        mark_iv: number(fields, "mark_iv")?,
        last_price: number(fields, "last_price")?,
        mark_price: number(fields, "mark_price")?,
        underlying_price: number(fields, "underlying_price")?,
        open_interest: number(fields, "open_interest")?,
        delta: number(fields, "delta")?,
        gamma: number(fields, "gamma")?,
        vega: number(fields, "vega")?,
        theta: number(fields, "theta")?,
        volume_24h: number(fields, "volume_24h")?,
        timestamp,
    })
}
