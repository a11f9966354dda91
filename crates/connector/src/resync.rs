//! Periodic symbol universe resync
//!
//! Options expire and new strikes are listed daily, so the subscription set is
//! rediscovered on a fixed interval and the difference applied incrementally.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::feed::FeedHandle;
use crate::stats::PipelineStats;
use crate::traits::SymbolDirectory;

/// Change between the current subscription set and a fresh discovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl SymbolDiff {
    pub fn between(current: &BTreeSet<String>, discovered: &BTreeSet<String>) -> Self {
        Self {
            added: discovered.difference(current).cloned().collect(),
            removed: current.difference(discovered).cloned().collect(),
        }
    }

    /// Initial subscription: everything is new
    pub fn initial(symbols: BTreeSet<String>) -> Self {
        Self {
            added: symbols,
            removed: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct ResyncScheduler {
    directory: Arc<dyn SymbolDirectory>,
    feed: FeedHandle,
    stats: Arc<PipelineStats>,
    interval: Duration,
}

impl ResyncScheduler {
    pub fn new(
        directory: Arc<dyn SymbolDirectory>,
        feed: FeedHandle,
        stats: Arc<PipelineStats>,
        interval: Duration,
    ) -> Self {
        Self {
            directory,
            feed,
            stats,
            interval,
        }
    }

    /// Discover, diff against the consumer's set, apply. Discovery failure
    /// leaves the subscription set unchanged.
    pub async fn resync_once(&self) -> Result<SymbolDiff, FeedError> {
        let discovered = match self.directory.discover().await {
            Ok(symbols) => symbols,
            Err(e) => {
                self.stats.record_discovery_failure();
                warn!(error = %e, "Resync discovery failed, keeping current symbols");
                return Ok(SymbolDiff::default());
            }
        };

        let current = self.feed.snapshot().await?;
        let diff = SymbolDiff::between(&current, &discovered);
        if diff.is_empty() {
            debug!(symbols = current.len(), "Resync found no changes");
            return Ok(diff);
        }

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            total = discovered.len(),
            "Applying symbol resync"
        );
        self.feed.apply(diff.clone()).await?;
        Ok(diff)
    }

    /// Resync every interval until shutdown. The first tick is skipped;
    /// startup has just discovered.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.resync_once().await {
                        warn!(error = %e, "Resync aborted, feed consumer unavailable");
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Resync scheduler stopped");
    }
}
