use async_trait::async_trait;
use chrono::{DateTime, Utc};
use optfeed_schema::{QuoteFilter, QuoteRecord};
use serde::Serialize;

use crate::error::StoreError;

/// A row the backend refused; the rest of its batch still commits
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRecord {
    pub symbol: String,
    pub reason: String,
}

/// Per-batch result of `QuoteStore::write_batch`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteOutcome {
    /// Rows accepted by the backend, including rows an existing newer
    /// record made obsolete
    pub committed: usize,
    /// Subset of `committed` that lost to a newer stored timestamp
    pub superseded: usize,
    pub rejected: Vec<RejectedRecord>,
}

impl WriteOutcome {
    pub fn all_committed(n: usize) -> Self {
        Self {
            committed: n,
            ..Default::default()
        }
    }
}

/// Summary published alongside the quotes for dashboard consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    /// Records written since process start
    pub messages: u64,
    pub last_update: DateTime<Utc>,
}

/// Persistence backend for quote records.
///
/// `write_batch` is an insert-or-update by symbol that keeps, per symbol, the
/// record with the greatest timestamp. On equal timestamps the later write
/// wins. A batch either commits as a unit (minus the rows listed in
/// `WriteOutcome::rejected`) or returns an error with nothing applied.
#[async_trait]
pub trait QuoteStore: Send + Sync {
    async fn write_batch(&self, batch: &[QuoteRecord]) -> Result<WriteOutcome, StoreError>;

    /// Matching quotes, highest 24h volume first
    async fn read(&self, filter: &QuoteFilter) -> Result<Vec<QuoteRecord>, StoreError>;

    /// Distinct expiry codes for an underlying, earliest first
    async fn expiries(&self, underlying: &str) -> Result<Vec<String>, StoreError>;

    /// Cheap liveness check
    async fn ping(&self) -> Result<(), StoreError>;

    async fn publish_stats(&self, _summary: &StatsSummary) -> Result<(), StoreError> {
        Ok(())
    }
}
