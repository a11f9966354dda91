//! End-to-end pipeline tests: scripted feed, static directory, in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{quote, symbols, wait_for, ScriptedConnector, StaticDirectory};
use optfeed_connector::{
    FeedEvent, Pipeline, PipelineConfig, PipelineError, RunningPipeline, SubscriptionState,
};
use optfeed_middleware::InMemoryQuoteStore;

const CALL: &str = "BTC-27DEC24-100000-C";
const PUT: &str = "BTC-27DEC24-90000-P";
const SOL: &str = "SOL-3JAN25-120-C-USDT";

fn config() -> PipelineConfig {
    PipelineConfig {
        batch_size: 50,
        batch_timeout: Duration::from_millis(50),
        resync_interval: Duration::from_secs(60),
        ..Default::default()
    }
}

async fn start(
    directory: &StaticDirectory,
) -> (RunningPipeline, ScriptedConnector, InMemoryQuoteStore) {
    let connector = ScriptedConnector::new();
    let store = InMemoryQuoteStore::new();
    let pipeline = Pipeline::start(
        config(),
        connector.clone(),
        Arc::new(directory.clone()),
        Arc::new(store.clone()),
    )
    .await
    .unwrap();
    (pipeline, connector, store)
}

async fn wait_until_active(pipeline: &RunningPipeline, n: usize) {
    for _ in 0..500 {
        let states = pipeline.feed().states().await.unwrap();
        if states.len() == n && states.values().all(|s| *s == SubscriptionState::Active) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("symbols never became active");
}

#[tokio::test(start_paused = true)]
async fn test_everything_enqueued_is_written() {
    let directory = StaticDirectory::new(&[CALL, PUT, SOL]);
    let (pipeline, connector, store) = start(&directory).await;
    wait_until_active(&pipeline, 3).await;

    for ts in 1..=20 {
        connector.inject(FeedEvent::Quotes(vec![
            quote(CALL, ts * 1_000),
            quote(PUT, ts * 1_000),
            quote(SOL, ts * 1_000),
        ]));
    }
    let stats = pipeline.stats();
    assert!(wait_for(Duration::from_secs(5), || stats.written() == 60).await);

    let snapshot = pipeline.shutdown().await;
    let c = &snapshot.counters;
    assert_eq!(c.received, 60);
    assert_eq!(c.written, c.enqueued);
    assert_eq!(c.dropped + c.failed + c.rejected, 0);
    assert_eq!(store.len().await, 3);
    assert_eq!(store.get(SOL).await.unwrap().mark_price, 20_000.0);

    // Final stats land in the store
    assert_eq!(store.last_stats().await.unwrap().messages, 60);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_arrivals_keep_newest() {
    let directory = StaticDirectory::new(&[CALL]);
    let (pipeline, connector, store) = start(&directory).await;
    wait_until_active(&pipeline, 1).await;

    for ts in [3_000, 1_000, 2_000] {
        connector.inject(FeedEvent::Quotes(vec![quote(CALL, ts)]));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let stats = pipeline.stats();
    assert!(wait_for(Duration::from_secs(5), || stats.written() == 3).await);

    let stored = store.get(CALL).await.unwrap();
    assert_eq!(stored.timestamp_ms(), 3_000);
    assert_eq!(stored.mark_price, 3_000.0);
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_periodic_resync_applies_diff() {
    let directory = StaticDirectory::new(&[CALL, PUT]);
    let (pipeline, connector, _store) = start(&directory).await;
    wait_until_active(&pipeline, 2).await;

    // First tick is skipped; nothing changes before the interval
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(connector.unsubscribes().is_empty());

    directory.set(&[CALL, SOL]);
    tokio::time::sleep(Duration::from_secs(31)).await;
    wait_until_active(&pipeline, 2).await;

    assert_eq!(pipeline.feed().snapshot().await.unwrap(), symbols(&[CALL, SOL]));
    assert_eq!(connector.unsubscribes(), vec![vec![PUT.to_string()]]);
    assert_eq!(
        connector
            .subscribed_symbols()
            .iter()
            .filter(|s| s.as_str() == SOL)
            .count(),
        1
    );
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_resync_discovery_failure_keeps_symbols() {
    let directory = StaticDirectory::new(&[CALL]);
    let (pipeline, connector, _store) = start(&directory).await;
    wait_until_active(&pipeline, 1).await;

    directory.fail();
    tokio::time::sleep(Duration::from_secs(61)).await;

    let stats = pipeline.stats();
    assert_eq!(stats.counters().discovery_failures, 1);
    assert_eq!(pipeline.feed().snapshot().await.unwrap(), symbols(&[CALL]));
    assert!(connector.unsubscribes().is_empty());
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_initial_discovery_failure_is_fatal() {
    let directory = StaticDirectory::default();
    directory.fail();
    let result = Pipeline::start(
        config(),
        ScriptedConnector::new(),
        Arc::new(directory),
        Arc::new(InMemoryQuoteStore::new()),
    )
    .await;
    assert!(matches!(result, Err(PipelineError::Discovery(_))));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_is_fatal() {
    let result = Pipeline::start(
        PipelineConfig {
            queue_capacity: 0,
            ..config()
        },
        ScriptedConnector::new(),
        Arc::new(StaticDirectory::new(&[CALL])),
        Arc::new(InMemoryQuoteStore::new()),
    )
    .await;
    assert!(matches!(result, Err(PipelineError::Config(_))));
}
