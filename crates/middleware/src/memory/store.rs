use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use optfeed_schema::{sort_expiries, QuoteFilter, QuoteRecord};

use crate::error::StoreError;
use crate::store::{QuoteStore, RejectedRecord, StatsSummary, WriteOutcome};

#[derive(Default)]
struct State {
    quotes: HashMap<String, QuoteRecord>,
    scripted: VecDeque<StoreError>,
    fail_always: Option<StoreError>,
    write_delay: Option<Duration>,
    last_stats: Option<StatsSummary>,
}

/// Last-write-wins quote map with scriptable failures
#[derive(Clone, Default)]
pub struct InMemoryQuoteStore {
    state: Arc<RwLock<State>>,
    write_calls: Arc<AtomicU64>,
    applied: Arc<AtomicU64>,
}

impl InMemoryQuoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue errors returned by the next `write_batch` calls, in order
    pub async fn fail_next(&self, errors: impl IntoIterator<Item = StoreError>) {
        let mut state = self.state.write().await;
        state.scripted.extend(errors);
    }

    /// Fail every write until cleared with `None`
    pub async fn set_fail_always(&self, error: Option<StoreError>) {
        self.state.write().await.fail_always = error;
    }

    pub async fn set_write_delay(&self, delay: Option<Duration>) {
        self.state.write().await.write_delay = delay;
    }

    /// Number of `write_batch` calls, failed ones included
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }

    /// Rows that replaced or created a stored record
    pub fn applied_rows(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub async fn get(&self, symbol: &str) -> Option<QuoteRecord> {
        self.state.read().await.quotes.get(symbol).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.quotes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.quotes.is_empty()
    }

    pub async fn last_stats(&self) -> Option<StatsSummary> {
        self.state.read().await.last_stats.clone()
    }
}

#[async_trait]
impl QuoteStore for InMemoryQuoteStore {
    async fn write_batch(&self, batch: &[QuoteRecord]) -> Result<WriteOutcome, StoreError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);

        let delay = self.state.read().await.write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }
        if let Some(err) = state.fail_always.clone() {
            return Err(err);
        }

        let mut outcome = WriteOutcome::default();
        for quote in batch {
            if let Some(reason) = quote.invalid_reason() {
                outcome.rejected.push(RejectedRecord {
                    symbol: quote.symbol.clone(),
                    reason,
                });
                continue;
            }

            outcome.committed += 1;
            let newer = state
                .quotes
                .get(&quote.symbol)
                .map(|current| quote.timestamp >= current.timestamp)
                .unwrap_or(true);
            if newer {
                state.quotes.insert(quote.symbol.clone(), quote.clone());
                self.applied.fetch_add(1, Ordering::Relaxed);
            } else {
                outcome.superseded += 1;
            }
        }

        Ok(outcome)
    }

    async fn read(&self, filter: &QuoteFilter) -> Result<Vec<QuoteRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(filter.apply(state.quotes.values().cloned()))
    }

    async fn expiries(&self, underlying: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.read().await;
        let set: BTreeSet<String> = state
            .quotes
            .values()
            .filter(|q| q.underlying.eq_ignore_ascii_case(underlying))
            .map(|q| q.expiry.clone())
            .collect();
        let mut out: Vec<String> = set.into_iter().collect();
        sort_expiries(&mut out);
        Ok(out)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        match &self.state.read().await.fail_always {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn publish_stats(&self, summary: &StatsSummary) -> Result<(), StoreError> {
        self.state.write().await.last_stats = Some(summary.clone());
        Ok(())
    }
}
