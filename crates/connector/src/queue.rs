//! Bounded ingest queue between the feed shards and the batch writer
//!
//! Push never blocks. When full, the configured `OverflowPolicy` decides which
//! record is lost, and the loss is counted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use optfeed_schema::QuoteRecord;

use crate::config::OverflowPolicy;
use crate::stats::PipelineStats;

pub struct IngestQueue {
    items: Mutex<VecDeque<QuoteRecord>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    stats: Arc<PipelineStats>,
}

impl IngestQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy, stats: Arc<PipelineStats>) -> Self {
        let capacity = capacity.max(1);
        stats.set_queue_capacity(capacity);
        stats.set_queue_depth(0);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            policy,
            stats,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QuoteRecord>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a record. Returns false when the record itself was refused.
    /// The depth gauge is updated under the lock so it never goes stale.
    pub fn push(&self, record: QuoteRecord) -> bool {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        self.stats.record_dropped();
                    }
                    OverflowPolicy::DropNewest => {
                        self.stats.record_dropped();
                        return false;
                    }
                }
            }
            items.push_back(record);
            self.stats.set_queue_depth(items.len());
        }
        self.stats.record_enqueued();
        self.notify.notify_one();
        true
    }

    /// Take up to `max` records in arrival order without waiting
    pub fn drain(&self, max: usize) -> Vec<QuoteRecord> {
        let mut items = self.lock();
        let n = max.min(items.len());
        let batch: Vec<_> = items.drain(..n).collect();
        self.stats.set_queue_depth(items.len());
        batch
    }

    /// Wait until `max` records are available or `timeout` elapses, then drain.
    /// The result may be empty.
    pub async fn next_batch(&self, max: usize, timeout: Duration) -> Vec<QuoteRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.len() >= max {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        self.drain(max)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
