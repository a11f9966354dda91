//! Batch writer: drains the ingest queue into the quote store
//!
//! One batch in flight at a time. Transient store errors are retried with
//! exponential backoff; sustained failure opens the circuit breaker, during
//! which the queue keeps absorbing (and evicting) records without backend
//! calls.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use optfeed_middleware::QuoteStore;
use optfeed_schema::QuoteRecord;

use crate::backoff::retry_delay;
use crate::circuit::{Admission, CircuitBreaker, CircuitBreakerConfig};
use crate::config::PipelineConfig;
use crate::queue::IngestQueue;
use crate::stats::PipelineStats;

#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub shutdown_grace: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl From<&PipelineConfig> for BatchWriterConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: config.retry_max_delay,
            shutdown_grace: config.shutdown_grace,
            breaker: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold,
                recovery_timeout: config.circuit_recovery_timeout,
            },
        }
    }
}

pub struct BatchWriter {
    store: Arc<dyn QuoteStore>,
    queue: Arc<IngestQueue>,
    stats: Arc<PipelineStats>,
    config: BatchWriterConfig,
    breaker: CircuitBreaker,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn QuoteStore>,
        queue: Arc<IngestQueue>,
        stats: Arc<PipelineStats>,
        config: BatchWriterConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.breaker.clone(), Instant::now());
        Self {
            store,
            queue,
            stats,
            config,
            breaker,
        }
    }

    /// Run until shutdown, then flush what is queued within the grace period
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "Batch writer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let admission = self.admit();
            let retries = match admission {
                Admission::Rejected { retry_in } => {
                    debug!(retry_in_ms = retry_in.as_millis() as u64, "Circuit open, holding writes");
                    tokio::select! {
                        _ = tokio::time::sleep(retry_in) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
                Admission::Trial => 0,
                Admission::Allowed => self.config.max_retries,
            };

            let batch = tokio::select! {
                batch = self.queue.next_batch(self.config.batch_size, self.config.batch_timeout) => batch,
                _ = shutdown.changed() => break,
            };
            if batch.is_empty() {
                continue;
            }

            let len = batch.len() as u64;
            let stats = self.stats.clone();
            let grace = self.config.shutdown_grace;
            let deadline = {
                let commit = self.commit(batch, retries);
                tokio::pin!(commit);
                tokio::select! {
                    _ = &mut commit => None,
                    _ = shutdown.changed() => {
                        let deadline = Instant::now() + grace;
                        if tokio::time::timeout_at(deadline, &mut commit).await.is_err() {
                            warn!(records = len, "In-flight batch interrupted by shutdown deadline");
                            stats.record_failed(len);
                            stats.record_failed_batch();
                        }
                        Some(deadline)
                    }
                }
            };
            if let Some(deadline) = deadline {
                self.flush(deadline).await;
                return;
            }
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        self.flush(deadline).await;
    }

    /// Write remaining queued records until the deadline; whatever is left
    /// afterwards is counted failed
    async fn flush(&mut self, deadline: Instant) {
        let queued = self.queue.len();
        info!(queued, grace_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64, "Flushing ingest queue");

        while !self.queue.is_empty() && Instant::now() < deadline {
            let retries = match self.admit() {
                Admission::Rejected { .. } => {
                    warn!("Circuit open during shutdown flush");
                    break;
                }
                Admission::Trial => 0,
                Admission::Allowed => self.config.max_retries,
            };
            let batch = self.queue.drain(self.config.batch_size);
            let len = batch.len() as u64;
            let stats = self.stats.clone();
            if tokio::time::timeout_at(deadline, self.commit(batch, retries))
                .await
                .is_err()
            {
                warn!(records = len, "Flush batch interrupted by shutdown deadline");
                stats.record_failed(len);
                stats.record_failed_batch();
                break;
            }
        }

        let leftover = self.queue.drain(usize::MAX);
        if !leftover.is_empty() {
            warn!(records = leftover.len(), "Records not flushed before shutdown");
            self.stats.record_failed(leftover.len() as u64);
        }
        info!(written = self.stats.written(), "Batch writer stopped");
    }

    fn admit(&mut self) -> Admission {
        let now = Instant::now();
        let admission = self.breaker.admit(now);
        self.stats.set_circuit_state(self.breaker.state(), now);
        admission
    }

    /// Commit one batch with up to `max_retries` retries on transient errors.
    /// Returns true when the batch reached the store.
    async fn commit(&mut self, batch: Vec<QuoteRecord>, max_retries: u32) -> bool {
        let len = batch.len();
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let result = self.store.write_batch(&batch).await;
            self.stats.record_batch_duration(started.elapsed());

            match result {
                Ok(outcome) => {
                    let rejected = outcome.rejected.len();
                    for r in &outcome.rejected {
                        warn!(symbol = %r.symbol, reason = %r.reason, "Record rejected by store");
                    }
                    self.stats.record_written(outcome.committed as u64);
                    if rejected > 0 {
                        self.stats.record_rejected(rejected as u64);
                    }
                    let unaccounted = len.saturating_sub(outcome.committed + rejected);
                    if unaccounted > 0 {
                        warn!(records = unaccounted, "Store outcome did not account for every record");
                        self.stats.record_failed(unaccounted as u64);
                    }
                    debug!(records = len, committed = outcome.committed, superseded = outcome.superseded, rejected, "Batch committed");

                    let now = Instant::now();
                    if self.breaker.on_success(now).is_some() {
                        self.stats.set_circuit_state(self.breaker.state(), now);
                    }
                    return true;
                }
                Err(e) if e.is_transient() && attempt < max_retries => {
                    attempt += 1;
                    let delay = retry_delay(
                        self.config.retry_base_delay,
                        self.config.retry_max_delay,
                        attempt,
                    );
                    warn!(error = %e, attempt, max_retries, delay_ms = delay.as_millis() as u64, "Batch write failed, retrying");
                    self.stats.record_retry();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(error = %e, records = len, attempts = attempt + 1, "Batch write failed");
                    self.stats.record_failed(len as u64);
                    self.stats.record_failed_batch();

                    let now = Instant::now();
                    if self.breaker.on_failure(now).is_some() {
                        warn!(
                            failures = self.breaker.consecutive_failures(),
                            "Circuit opened, pausing store writes"
                        );
                    }
                    self.stats.set_circuit_state(self.breaker.state(), now);
                    return false;
                }
            }
        }
    }
}
