//! Pipeline counters, health verdict, and the periodic stats reporter
//!
//! Every component holds an `Arc<PipelineStats>` and records into it; nothing
//! reads these values to make data-flow decisions.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use optfeed_middleware::{QuoteStore, StatsSummary};

use crate::circuit::CircuitState;
use crate::config::HealthThresholds;
use crate::metrics;

#[derive(Debug)]
pub struct PipelineStats {
    started: Instant,
    received: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    failed_batches: AtomicU64,
    retries: AtomicU64,
    parse_errors: AtomicU64,
    circuit_open_events: AtomicU64,
    reconnects: AtomicU64,
    discovery_failures: AtomicU64,

    queue_depth: AtomicU64,
    queue_capacity: AtomicU64,
    circuit_state: AtomicI64,
    circuit_open_since: Mutex<Option<Instant>>,
    active_connections: AtomicI64,
    subscribed_symbols: AtomicU64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            received: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            written: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            circuit_open_events: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            discovery_failures: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            queue_capacity: AtomicU64::new(0),
            circuit_state: AtomicI64::new(CircuitState::Closed.as_gauge()),
            circuit_open_since: Mutex::new(None),
            active_connections: AtomicI64::new(0),
            subscribed_symbols: AtomicU64::new(0),
        }
    }

    pub fn record_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
        metrics::inc_records("received", n);
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::inc_records("enqueued", 1);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::inc_records("dropped", 1);
    }

    pub fn record_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::Relaxed);
        metrics::inc_records("written", n);
    }

    pub fn record_rejected(&self, n: u64) {
        self.rejected.fetch_add(n, Ordering::Relaxed);
        metrics::inc_records("rejected", n);
    }

    pub fn record_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
        metrics::inc_records("failed", n);
    }

    pub fn record_failed_batch(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        metrics::inc_write_retries();
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
        metrics::inc_parse_errors();
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::inc_reconnects();
    }

    pub fn record_discovery_failure(&self) {
        self.discovery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_duration(&self, elapsed: Duration) {
        metrics::observe_batch_write(elapsed.as_secs_f64());
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
        metrics::set_queue_depth(depth);
    }

    pub fn set_queue_capacity(&self, capacity: usize) {
        self.queue_capacity.store(capacity as u64, Ordering::Relaxed);
    }

    pub fn set_circuit_state(&self, state: CircuitState, now: Instant) {
        let previous = CircuitState::from_gauge(
            self.circuit_state.swap(state.as_gauge(), Ordering::Relaxed),
        );
        metrics::set_circuit_state(state.as_gauge());

        let mut since = self
            .circuit_open_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match state {
            CircuitState::Closed => *since = None,
            CircuitState::Open => {
                if previous == CircuitState::Closed {
                    self.circuit_open_events.fetch_add(1, Ordering::Relaxed);
                }
                // A failed half-open trial keeps the original outage start
                if since.is_none() {
                    *since = Some(now);
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    pub fn connection_opened(&self) {
        let n = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_connected_shards(n);
    }

    pub fn connection_closed(&self) {
        let n = self.active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::set_connected_shards(n.max(0));
    }

    pub fn set_subscribed_symbols(&self, count: usize) {
        self.subscribed_symbols.store(count as u64, Ordering::Relaxed);
        metrics::set_subscribed_symbols(count);
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            circuit_open_events: self.circuit_open_events.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            discovery_failures: self.discovery_failures.load(Ordering::Relaxed),
        }
    }

    fn circuit_open_for(&self, now: Instant) -> Option<Duration> {
        self.circuit_open_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|since| now.saturating_duration_since(since))
    }

    pub fn health(&self, thresholds: &HealthThresholds) -> HealthReport {
        let now = Instant::now();
        let mut reasons = Vec::new();

        if let Some(open_for) = self.circuit_open_for(now) {
            if open_for > thresholds.max_circuit_open {
                reasons.push(format!(
                    "circuit open for {}s (limit {}s)",
                    open_for.as_secs(),
                    thresholds.max_circuit_open.as_secs()
                ));
            }
        }

        let depth = self.queue_depth.load(Ordering::Relaxed) as f64;
        let capacity = self.queue_capacity.load(Ordering::Relaxed) as f64;
        if capacity > 0.0 && depth > thresholds.max_queue_fill * capacity {
            reasons.push(format!(
                "queue depth {} above {:.0}% of capacity {}",
                depth,
                thresholds.max_queue_fill * 100.0,
                capacity
            ));
        }

        HealthReport {
            status: if reasons.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            reasons,
        }
    }

    pub fn snapshot(&self, thresholds: &HealthThresholds) -> StatsSnapshot {
        let now = Instant::now();
        let health = self.health(thresholds);
        StatsSnapshot {
            status: health.status,
            reasons: health.reasons,
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            counters: self.counters(),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_capacity: self.queue_capacity.load(Ordering::Relaxed),
            circuit_state: CircuitState::from_gauge(self.circuit_state.load(Ordering::Relaxed)),
            circuit_open_secs: self.circuit_open_for(now).map(|d| d.as_secs()),
            active_connections: self.active_connections.load(Ordering::Relaxed).max(0) as u64,
            subscribed_symbols: self.subscribed_symbols.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub reasons: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub received: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub written: u64,
    pub rejected: u64,
    pub failed: u64,
    pub failed_batches: u64,
    pub retries: u64,
    pub parse_errors: u64,
    pub circuit_open_events: u64,
    pub reconnects: u64,
    pub discovery_failures: u64,
}

/// Immutable point-in-time copy of the pipeline state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub status: HealthStatus,
    pub reasons: Vec<String>,
    pub uptime_secs: u64,
    pub counters: CounterSnapshot,
    pub queue_depth: u64,
    pub queue_capacity: u64,
    pub circuit_state: CircuitState,
    pub circuit_open_secs: Option<u64>,
    pub active_connections: u64,
    pub subscribed_symbols: u64,
}

/// Destination for periodic stats
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn publish(&self, snapshot: &StatsSnapshot);
}

/// Publishes the `messages`/`last_update` summary through the quote store
pub struct StoreStatsSink {
    store: Arc<dyn QuoteStore>,
}

impl StoreStatsSink {
    pub fn new(store: Arc<dyn QuoteStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StatsSink for StoreStatsSink {
    async fn publish(&self, snapshot: &StatsSnapshot) {
        let summary = StatsSummary {
            messages: snapshot.counters.written,
            last_update: chrono::Utc::now(),
        };
        if let Err(e) = self.store.publish_stats(&summary).await {
            warn!(error = %e, "Failed to publish stats summary");
        }
    }
}

#[derive(Clone)]
pub struct StatsReporter {
    stats: Arc<PipelineStats>,
    thresholds: HealthThresholds,
    interval: Duration,
    sink: Arc<dyn StatsSink>,
}

impl StatsReporter {
    pub fn new(
        stats: Arc<PipelineStats>,
        thresholds: HealthThresholds,
        interval: Duration,
        sink: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            stats,
            thresholds,
            interval,
            sink,
        }
    }

    /// Log and publish one snapshot
    pub async fn report(&self) -> StatsSnapshot {
        let snapshot = self.stats.snapshot(&self.thresholds);
        let c = &snapshot.counters;
        info!(
            status = ?snapshot.status,
            received = c.received,
            enqueued = c.enqueued,
            dropped = c.dropped,
            written = c.written,
            rejected = c.rejected,
            failed = c.failed,
            retries = c.retries,
            parse_errors = c.parse_errors,
            reconnects = c.reconnects,
            queue_depth = snapshot.queue_depth,
            circuit = %snapshot.circuit_state,
            connections = snapshot.active_connections,
            symbols = snapshot.subscribed_symbols,
            "Pipeline stats"
        );
        if !snapshot.reasons.is_empty() {
            warn!(reasons = ?snapshot.reasons, "Pipeline unhealthy");
        }
        self.sink.publish(&snapshot).await;
        snapshot
    }

    /// Report every interval until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let start = Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.report().await;
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optfeed_middleware::InMemoryQuoteStore;

    #[tokio::test(start_paused = true)]
    async fn test_health_circuit_open_too_long() {
        let stats = PipelineStats::new();
        let thresholds = HealthThresholds {
            max_circuit_open: Duration::from_secs(60),
            max_queue_fill: 0.9,
        };
        stats.set_circuit_state(CircuitState::Open, Instant::now());
        assert!(stats.health(&thresholds).is_healthy());

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = stats.health(&thresholds);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.reasons[0].contains("circuit open"));

        // Failed trial keeps the outage start
        stats.set_circuit_state(CircuitState::HalfOpen, Instant::now());
        stats.set_circuit_state(CircuitState::Open, Instant::now());
        assert!(!stats.health(&thresholds).is_healthy());
        assert_eq!(stats.counters().circuit_open_events, 1);

        stats.set_circuit_state(CircuitState::Closed, Instant::now());
        assert!(stats.health(&thresholds).is_healthy());
    }

    #[test]
    fn test_health_queue_fill() {
        let stats = PipelineStats::new();
        let thresholds = HealthThresholds::default();
        stats.set_queue_capacity(100);
        stats.set_queue_depth(90);
        assert!(stats.health(&thresholds).is_healthy());
        stats.set_queue_depth(91);
        assert!(!stats.health(&thresholds).is_healthy());
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = PipelineStats::new();
        stats.record_received(5);
        stats.record_written(4);
        stats.connection_opened();
        let snapshot = stats.snapshot(&HealthThresholds::default());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["counters"]["received"], 5);
        assert_eq!(json["counters"]["written"], 4);
        assert_eq!(json["circuit_state"], "closed");
        assert_eq!(json["active_connections"], 1);
    }

    #[tokio::test]
    async fn test_reporter_publishes_to_store() {
        let store = Arc::new(InMemoryQuoteStore::new());
        let stats = Arc::new(PipelineStats::new());
        stats.record_written(42);
        let reporter = StatsReporter::new(
            stats,
            HealthThresholds::default(),
            Duration::from_secs(30),
            Arc::new(StoreStatsSink::new(store.clone())),
        );
        let snapshot = reporter.report().await;
        assert_eq!(snapshot.counters.written, 42);
        assert_eq!(store.last_stats().await.unwrap().messages, 42);
    }
}
