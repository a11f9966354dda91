//! Integration tests for the batch writer against the in-memory store.
//!
//! Paused tokio time drives retry delays, circuit recovery and the shutdown
//! grace period.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use common::quote;
use optfeed_connector::{
    BatchWriter, BatchWriterConfig, CircuitState, IngestQueue, OverflowPolicy, PipelineConfig,
    PipelineStats,
};
use optfeed_middleware::{InMemoryQuoteStore, StoreError};

fn symbol(i: usize) -> String {
    format!("ETH-28MAR25-{}-P", 1000 + i * 100)
}

struct Harness {
    store: InMemoryQuoteStore,
    queue: Arc<IngestQueue>,
    stats: Arc<PipelineStats>,
    writer: BatchWriter,
}

fn setup(config: PipelineConfig) -> Harness {
    let store = InMemoryQuoteStore::new();
    let stats = Arc::new(PipelineStats::new());
    let queue = Arc::new(IngestQueue::new(
        config.queue_capacity,
        OverflowPolicy::DropOldest,
        stats.clone(),
    ));
    let writer = BatchWriter::new(
        Arc::new(store.clone()),
        queue.clone(),
        stats.clone(),
        BatchWriterConfig::from(&config),
    );
    Harness {
        store,
        queue,
        stats,
        writer,
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_and_admits_one_trial() {
    let h = setup(PipelineConfig {
        batch_size: 1,
        max_retries: 0,
        failure_threshold: 3,
        circuit_recovery_timeout: Duration::from_secs(30),
        ..Default::default()
    });
    h.store
        .set_fail_always(Some(StoreError::Permanent("READONLY".into())))
        .await;
    for i in 0..10 {
        h.queue.push(quote(&symbol(i), 1_000));
    }

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(h.writer.run(rx));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.store.write_calls(), 3);
    let snapshot = h.stats.snapshot(&Default::default());
    assert_eq!(snapshot.circuit_state, CircuitState::Open);
    assert_eq!(snapshot.counters.circuit_open_events, 1);

    // Open: no backend calls until the recovery timeout
    tokio::time::sleep(Duration::from_secs(28)).await;
    assert_eq!(h.store.write_calls(), 3);

    // Exactly one trial, which fails and restarts the timer
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.store.write_calls(), 4);
    tokio::time::sleep(Duration::from_secs(28)).await;
    assert_eq!(h.store.write_calls(), 4);

    // Backend recovers: the next trial closes the circuit and the rest drains
    h.store.set_fail_always(None).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let snapshot = h.stats.snapshot(&Default::default());
    assert_eq!(snapshot.circuit_state, CircuitState::Closed);
    assert_eq!(snapshot.counters.failed, 4);
    assert_eq!(snapshot.counters.written, 6);
    assert_eq!(snapshot.counters.circuit_open_events, 1);
    assert_eq!(h.store.len().await, 6);

    tx.send(true).unwrap();
    task.await.unwrap();
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_fail_fail_succeed_commits_once() {
    let h = setup(PipelineConfig::default());
    h.store
        .fail_next([
            StoreError::Transient("timed out".into()),
            StoreError::Transient("TRYAGAIN".into()),
        ])
        .await;
    h.queue.push(quote(&symbol(1), 1_000));

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(h.writer.run(rx));
    tokio::time::sleep(Duration::from_secs(2)).await;
    tx.send(true).unwrap();
    task.await.unwrap();

    let c = h.stats.counters();
    assert_eq!(h.store.write_calls(), 3);
    assert_eq!(h.store.applied_rows(), 1);
    assert_eq!(c.retries, 2);
    assert_eq!(c.written, 1);
    assert_eq!(c.failed, 0);
    assert_eq!(
        h.stats.snapshot(&Default::default()).circuit_state,
        CircuitState::Closed
    );
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_flush_respects_grace() {
    let h = setup(PipelineConfig {
        batch_size: 10,
        shutdown_grace: Duration::from_secs(2),
        ..Default::default()
    });
    h.store
        .set_write_delay(Some(Duration::from_millis(800)))
        .await;
    for i in 0..30 {
        h.queue.push(quote(&symbol(i), 1_000));
    }

    // Shutdown requested before the writer ever ran
    let (_tx, rx) = watch::channel(true);
    h.writer.run(rx).await;

    // Two batches fit in the grace period; the third is cut off
    let c = h.stats.counters();
    assert_eq!(c.written, 20);
    assert_eq!(c.failed, 10);
    assert_eq!(c.written + c.failed, c.enqueued);
    assert!(h.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_overflow_while_circuit_open() {
    let h = setup(PipelineConfig {
        batch_size: 1,
        max_retries: 0,
        failure_threshold: 1,
        queue_capacity: 5,
        ..Default::default()
    });
    h.store
        .set_fail_always(Some(StoreError::Permanent("READONLY".into())))
        .await;
    h.queue.push(quote(&symbol(0), 1_000));

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(h.writer.run(rx));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.store.write_calls(), 1);

    // Queue keeps absorbing and evicting while writes are held
    for i in 1..=8 {
        h.queue.push(quote(&symbol(i), 1_000));
    }
    assert_eq!(h.queue.len(), 5);
    let c = h.stats.counters();
    assert_eq!(c.dropped, 3);
    assert_eq!(h.store.write_calls(), 1);

    tx.send(true).unwrap();
    task.await.unwrap();
}
