//! Redis quote store
//!
//! One hash per option at `option:{SYMBOL}`, a set per underlying at
//! `option-index:{UNDERLYING}`, and a `stats:global` hash. Each batch runs as a
//! single Lua script so it commits atomically and the timestamp comparison
//! happens server-side.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::{BTreeSet, HashMap};

use optfeed_schema::{sort_expiries, QuoteFilter, QuoteRecord};

use crate::codec::{self, STATS_KEY};
use crate::error::StoreError;
use crate::store::{QuoteStore, RejectedRecord, StatsSummary, WriteOutcome};

/// KEYS come in pairs (quote hash, index set). ARGV per row: symbol,
/// timestamp, field count, then field/value pairs. Returns 1 per applied row
/// and 0 per row an equal-or-newer stored timestamp did not replace.
const UPSERT_SCRIPT: &str = r#"
local out = {}
local pos = 1
for i = 1, #KEYS, 2 do
  local key = KEYS[i]
  local index = KEYS[i + 1]
  local symbol = ARGV[pos]
  local ts = tonumber(ARGV[pos + 1])
  local n = tonumber(ARGV[pos + 2])
  local current = tonumber(redis.call('HGET', key, 'timestamp'))
  if current == nil or ts >= current then
    local fields = {}
    for j = 0, n - 1 do
      fields[#fields + 1] = ARGV[pos + 3 + 2 * j]
      fields[#fields + 1] = ARGV[pos + 4 + 2 * j]
    end
    redis.call('HSET', key, unpack(fields))
    out[#out + 1] = 1
  else
    out[#out + 1] = 0
  end
  redis.call('SADD', index, symbol)
  pos = pos + 3 + 2 * n
end
return out
"#;

pub struct RedisQuoteStore {
    conn: ConnectionManager,
    script: redis::Script,
}

impl RedisQuoteStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Permanent(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client).await.map_err(classify)?;

        let store = Self {
            conn,
            script: redis::Script::new(UPSERT_SCRIPT),
        };
        store.ping().await?;

        tracing::info!("Connected to Redis");
        Ok(store)
    }
}

/// Map a redis error onto the retry taxonomy
pub fn classify(err: redis::RedisError) -> StoreError {
    let transient = err.is_timeout()
        || err.is_io_error()
        || err.is_connection_dropped()
        || matches!(
            err.code(),
            Some("BUSY") | Some("TRYAGAIN") | Some("LOADING") | Some("MASTERDOWN")
        );
    if transient {
        StoreError::Transient(err.to_string())
    } else {
        StoreError::Permanent(err.to_string())
    }
}

#[async_trait]
impl QuoteStore for RedisQuoteStore {
    async fn write_batch(&self, batch: &[QuoteRecord]) -> Result<WriteOutcome, StoreError> {
        let mut outcome = WriteOutcome::default();
        let mut invocation = self.script.prepare_invoke();
        let mut rows = 0usize;

        for quote in batch {
            if let Some(reason) = quote.invalid_reason() {
                outcome.rejected.push(RejectedRecord {
                    symbol: quote.symbol.clone(),
                    reason,
                });
                continue;
            }

            let fields = codec::to_fields(quote);
            invocation
                .key(codec::quote_key(&quote.symbol))
                .key(codec::index_key(&quote.underlying))
                .arg(&quote.symbol)
                .arg(quote.timestamp_ms())
                .arg(fields.len());
            for (name, value) in fields {
                invocation.arg(name).arg(value);
            }
            rows += 1;
        }

        if rows == 0 {
            return Ok(outcome);
        }

        let mut conn = self.conn.clone();
        let statuses: Vec<i64> = invocation.invoke_async(&mut conn).await.map_err(classify)?;
        if statuses.len() != rows {
            return Err(StoreError::Permanent(format!(
                "upsert script returned {} statuses for {} rows",
                statuses.len(),
                rows
            )));
        }

        outcome.committed = rows;
        outcome.superseded = statuses.iter().filter(|s| **s == 0).count();
        tracing::debug!(
            committed = outcome.committed,
            superseded = outcome.superseded,
            rejected = outcome.rejected.len(),
            "Batch upserted"
        );
        Ok(outcome)
    }

    async fn read(&self, filter: &QuoteFilter) -> Result<Vec<QuoteRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let symbols: Vec<String> = redis::cmd("SMEMBERS")
            .arg(codec::index_key(&filter.underlying))
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for symbol in &symbols {
            pipe.hgetall(codec::quote_key(symbol));
        }
        let rows: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(classify)?;

        let quotes = rows.into_iter().filter(|r| !r.is_empty()).filter_map(|row| {
            match codec::from_fields(&row) {
                Ok(q) => Some(q),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable quote hash");
                    None
                }
            }
        });
        Ok(filter.apply(quotes))
    }

    async fn expiries(&self, underlying: &str) -> Result<Vec<String>, StoreError> {
        let all = QuoteFilter::underlying(underlying).with_limit(usize::MAX);
        let quotes = self.read(&all).await?;
        let set: BTreeSet<String> = quotes.into_iter().map(|q| q.expiry).collect();
        let mut out: Vec<String> = set.into_iter().collect();
        sort_expiries(&mut out);
        Ok(out)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn publish_stats(&self, summary: &StatsSummary) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .hset(STATS_KEY, "messages", summary.messages)
            .hset(STATS_KEY, "last_update", summary.last_update.to_rfc3339())
            .query_async::<()>(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
