//! Bybit v5 public option stream messages
//!
//! Data frames look like
//! `{"id":..,"topic":"tickers.BTC-27DEC24-100000-C","ts":1703664000000,"type":"snapshot","data":{..}}`.
//! Control replies carry `op` (`subscribe`, `unsubscribe`, `pong`, or `ping`
//! with `ret_msg: "pong"` on some clusters).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use optfeed_schema::{OptionSymbol, QuoteRecord, SymbolError};

use crate::message::{FeedEvent, SubscribeAck};

pub const TICKER_TOPIC_PREFIX: &str = "tickers.";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid symbol: {0}")]
    Symbol(#[from] SymbolError),
    #[error("invalid timestamp {0}")]
    Timestamp(i64),
    #[error("topic {topic} does not match data symbol {symbol}")]
    TopicMismatch { topic: String, symbol: String },
}

/// Outbound request: `{"op":"subscribe","req_id":"..","args":["tickers.X",..]}`
#[derive(Debug, Serialize)]
pub struct WsRequest<'a> {
    pub op: &'a str,
    pub req_id: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl<'a> WsRequest<'a> {
    pub fn subscribe(req_id: &'a str, symbols: &[String]) -> Self {
        Self {
            op: "subscribe",
            req_id,
            args: symbols.iter().map(|s| ticker_topic(s)).collect(),
        }
    }

    pub fn unsubscribe(req_id: &'a str, symbols: &[String]) -> Self {
        Self {
            op: "unsubscribe",
            req_id,
            args: symbols.iter().map(|s| ticker_topic(s)).collect(),
        }
    }

    pub fn ping(req_id: &'a str) -> Self {
        Self {
            op: "ping",
            req_id,
            args: Vec::new(),
        }
    }
}

pub fn ticker_topic(symbol: &str) -> String {
    format!("{}{}", TICKER_TOPIC_PREFIX, symbol)
}

/// Numbers arrive as strings (`"0.4512"`); accept plain JSON numbers too
fn de_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("number out of range")),
        other => Err(serde::de::Error::custom(format!(
            "expected numeric string, got {}",
            other
        ))),
    }
}

/// Optional numeric field; an empty string counts as absent
fn de_opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected numeric string, got {}",
            other
        ))),
    }
}

/// Option ticker payload. Unknown fields are rejected so a venue schema
/// change surfaces as parse errors instead of silently missing data.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OptionTicker {
    pub symbol: String,
    #[serde(deserialize_with = "de_f64")]
    pub mark_price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub mark_price_iv: f64,
    #[serde(deserialize_with = "de_f64")]
    pub delta: f64,
    #[serde(deserialize_with = "de_f64")]
    pub gamma: f64,
    #[serde(deserialize_with = "de_f64")]
    pub vega: f64,
    #[serde(deserialize_with = "de_f64")]
    pub theta: f64,

    #[serde(default, deserialize_with = "de_opt_f64")]
    pub bid_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub bid_size: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub bid_iv: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub ask_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub ask_size: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub ask_iv: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub last_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub high_price24h: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub low_price24h: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub index_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub underlying_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub open_interest: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub turnover24h: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub volume24h: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub total_volume: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub total_turnover: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub predicted_delivery_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub change24h: Option<f64>,
}

impl OptionTicker {
    pub fn into_record(self, ts_ms: i64) -> Result<QuoteRecord, ParseError> {
        let parsed = OptionSymbol::parse(&self.symbol)?;
        let timestamp =
            QuoteRecord::timestamp_from_ms(ts_ms).ok_or(ParseError::Timestamp(ts_ms))?;
        let mut record = QuoteRecord::for_symbol(&parsed, &self.symbol, timestamp);
        record.bid_iv = self.bid_iv.unwrap_or(0.0);
        record.ask_iv = self.ask_iv.unwrap_or(0.0);
        record.mark_iv = self.mark_price_iv;
        record.last_price = self.last_price.unwrap_or(0.0);
        record.mark_price = self.mark_price;
        record.underlying_price = self.underlying_price.unwrap_or(0.0);
        record.open_interest = self.open_interest.unwrap_or(0.0);
        record.delta = self.delta;
        record.gamma = self.gamma;
        record.vega = self.vega;
        record.theta = self.theta;
        record.volume_24h = self.volume24h.unwrap_or(0.0);
        Ok(record)
    }
}

#[derive(Debug, Deserialize)]
struct TickerFrame {
    topic: String,
    ts: i64,
    /// Object for option tickers, array on some other categories
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    op: String,
    #[serde(default)]
    req_id: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    ret_msg: Option<String>,
}

/// Decode one text frame. Malformed frames become `FeedEvent::Malformed`.
pub fn parse_frame(text: &str) -> FeedEvent {
    match try_parse_frame(text) {
        Ok(event) => event,
        Err(e) => FeedEvent::Malformed(e.to_string()),
    }
}

fn try_parse_frame(text: &str) -> Result<FeedEvent, ParseError> {
    let value: Value = serde_json::from_str(text)?;

    if let Some(topic) = value.get("topic").and_then(|t| t.as_str()) {
        if !topic.starts_with(TICKER_TOPIC_PREFIX) {
            return Ok(FeedEvent::Ignored);
        }
        let frame: TickerFrame = serde_json::from_value(value)?;
        let tickers: Vec<OptionTicker> = match frame.data {
            Value::Array(_) => serde_json::from_value(frame.data)?,
            data => vec![serde_json::from_value(data)?],
        };
        let topic_symbol = &frame.topic[TICKER_TOPIC_PREFIX.len()..];
        let mut records = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            if !ticker.symbol.eq_ignore_ascii_case(topic_symbol) {
                return Err(ParseError::TopicMismatch {
                    topic: frame.topic.clone(),
                    symbol: ticker.symbol,
                });
            }
            records.push(ticker.into_record(frame.ts)?);
        }
        return Ok(FeedEvent::Quotes(records));
    }

    if value.get("op").is_some() {
        let control: ControlFrame = serde_json::from_value(value)?;
        let is_pong = control.op == "pong"
            || (control.op == "ping" && control.ret_msg.as_deref() == Some("pong"));
        if is_pong {
            return Ok(FeedEvent::Pong);
        }
        if control.op == "subscribe" || control.op == "unsubscribe" {
            return Ok(FeedEvent::Ack(SubscribeAck {
                req_id: control.req_id,
                op: control.op,
                success: control.success.unwrap_or(false),
                ret_msg: control.ret_msg.unwrap_or_default(),
            }));
        }
    }

    Ok(FeedEvent::Ignored)
}
