//! Pipeline assembly and ordered shutdown
//!
//! ```text
//! SymbolDirectory -> FeedConsumer -> shards -> IngestQueue -> BatchWriter -> QuoteStore
//!                        ^                                        |
//!                  ResyncScheduler                          PipelineStats -> StatsReporter
//! ```

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use optfeed_middleware::QuoteStore;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::feed::{FeedConsumer, FeedHandle};
use crate::queue::IngestQueue;
use crate::resync::{ResyncScheduler, SymbolDiff};
use crate::stats::{PipelineStats, StatsReporter, StatsSink, StatsSnapshot, StoreStatsSink};
use crate::traits::{FeedConnector, SymbolDirectory};
use crate::writer::{BatchWriter, BatchWriterConfig};

pub struct Pipeline;

impl Pipeline {
    /// Discover symbols, spawn every component and subscribe the initial set.
    /// A discovery failure here is fatal.
    pub async fn start<C: FeedConnector>(
        config: PipelineConfig,
        connector: C,
        directory: Arc<dyn SymbolDirectory>,
        store: Arc<dyn QuoteStore>,
    ) -> Result<RunningPipeline, PipelineError> {
        let sink: Arc<dyn StatsSink> = Arc::new(StoreStatsSink::new(Arc::clone(&store)));
        Self::start_with_sink(config, connector, directory, store, sink).await
    }

    pub async fn start_with_sink<C: FeedConnector>(
        config: PipelineConfig,
        connector: C,
        directory: Arc<dyn SymbolDirectory>,
        store: Arc<dyn QuoteStore>,
        sink: Arc<dyn StatsSink>,
    ) -> Result<RunningPipeline, PipelineError> {
        config.validate()?;

        let initial = directory.discover().await?;
        info!(symbols = initial.len(), "Initial discovery complete");

        let stats = Arc::new(PipelineStats::new());
        let queue = Arc::new(IngestQueue::new(
            config.queue_capacity,
            config.overflow_policy,
            Arc::clone(&stats),
        ));

        let (feed_tx, feed_rx) = watch::channel(false);
        let (writer_tx, writer_rx) = watch::channel(false);
        let (aux_tx, aux_rx) = watch::channel(false);

        let (consumer, feed) =
            FeedConsumer::new(connector, &config, Arc::clone(&queue), Arc::clone(&stats));
        let feed_task = tokio::spawn(consumer.run(feed_rx));

        let writer = BatchWriter::new(
            store,
            Arc::clone(&queue),
            Arc::clone(&stats),
            BatchWriterConfig::from(&config),
        );
        let writer_task = tokio::spawn(writer.run(writer_rx));

        if let Err(e) = feed.apply(SymbolDiff::initial(initial)).await {
            warn!(error = %e, "Initial subscribe failed, stopping started tasks");
            stop_feed_and_writer(&feed_tx, feed_task, &writer_tx, writer_task).await;
            return Err(e.into());
        }

        let resync = ResyncScheduler::new(
            directory,
            feed.clone(),
            Arc::clone(&stats),
            config.resync_interval,
        );
        let resync_task = tokio::spawn(resync.run(aux_rx.clone()));

        let reporter = StatsReporter::new(
            Arc::clone(&stats),
            config.health.clone(),
            config.stats_interval,
            sink,
        );
        let reporter_task = tokio::spawn(reporter.clone().run(aux_rx));

        info!("Pipeline started");
        Ok(RunningPipeline {
            feed,
            stats,
            queue,
            reporter,
            feed_shutdown: feed_tx,
            writer_shutdown: writer_tx,
            aux_shutdown: aux_tx,
            feed_task,
            writer_task,
            resync_task,
            reporter_task,
        })
    }
}

pub struct RunningPipeline {
    feed: FeedHandle,
    stats: Arc<PipelineStats>,
    queue: Arc<IngestQueue>,
    reporter: StatsReporter,
    feed_shutdown: watch::Sender<bool>,
    writer_shutdown: watch::Sender<bool>,
    aux_shutdown: watch::Sender<bool>,
    feed_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    resync_task: JoinHandle<()>,
    reporter_task: JoinHandle<()>,
}

impl RunningPipeline {
    pub fn feed(&self) -> &FeedHandle {
        &self.feed
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Stop resync and reporting, close the feed, flush the writer within the
    /// grace period, then log and publish final stats
    pub async fn shutdown(self) -> StatsSnapshot {
        info!("Shutting down pipeline");

        let _ = self.aux_shutdown.send(true);
        join("resync", self.resync_task).await;
        join("reporter", self.reporter_task).await;

        stop_feed_and_writer(
            &self.feed_shutdown,
            self.feed_task,
            &self.writer_shutdown,
            self.writer_task,
        )
        .await;

        let snapshot = self.reporter.report().await;
        info!(
            written = snapshot.counters.written,
            failed = snapshot.counters.failed,
            dropped = snapshot.counters.dropped,
            "Pipeline stopped"
        );
        snapshot
    }
}

/// Close the feed first so nothing new is queued, then let the writer flush
async fn stop_feed_and_writer(
    feed_shutdown: &watch::Sender<bool>,
    feed_task: JoinHandle<()>,
    writer_shutdown: &watch::Sender<bool>,
    writer_task: JoinHandle<()>,
) {
    let _ = feed_shutdown.send(true);
    join("feed consumer", feed_task).await;

    let _ = writer_shutdown.send(true);
    join("batch writer", writer_task).await;
}

async fn join(name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!(task = name, error = %e, "Pipeline task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use chrono::TimeZone;
    use optfeed_middleware::InMemoryQuoteStore;
    use optfeed_schema::{OptionSymbol, QuoteRecord};

    fn record(symbol: &str) -> QuoteRecord {
        let parsed = OptionSymbol::parse(symbol).unwrap();
        let ts = chrono::Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        QuoteRecord::for_symbol(&parsed, symbol, ts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_feed_and_writer_flushes_and_joins() {
        let (feed_tx, mut feed_rx) = watch::channel(false);
        let feed_task = tokio::spawn(async move {
            let _ = feed_rx.changed().await;
        });

        let store = InMemoryQuoteStore::new();
        let stats = Arc::new(PipelineStats::new());
        let queue = Arc::new(IngestQueue::new(
            10,
            OverflowPolicy::DropOldest,
            Arc::clone(&stats),
        ));
        queue.push(record("BTC-27DEC24-100000-C"));
        queue.push(record("BTC-27DEC24-90000-P"));

        let config = PipelineConfig {
            batch_timeout: std::time::Duration::from_secs(3600),
            ..Default::default()
        };
        let (writer_tx, writer_rx) = watch::channel(false);
        let writer = BatchWriter::new(
            Arc::new(store.clone()),
            Arc::clone(&queue),
            Arc::clone(&stats),
            BatchWriterConfig::from(&config),
        );
        let writer_task = tokio::spawn(writer.run(writer_rx));

        stop_feed_and_writer(&feed_tx, feed_task, &writer_tx, writer_task).await;

        assert!(queue.is_empty());
        assert_eq!(stats.written(), 2);
        assert_eq!(store.len().await, 2);
    }
}
