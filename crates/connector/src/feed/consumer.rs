//! Consumer task: symbol set ownership and shard routing
//!
//! New symbols go to the shard with the fewest symbols that still has room;
//! a shard is spawned when every shard is full. Removals are routed to the
//! owning shard and a shard left with no symbols is closed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::feed::shard::{ShardCommand, ShardEvent, ShardSettings, ShardWorker};
use crate::feed::{FeedCommand, FeedHandle, SubscriptionState};
use crate::queue::IngestQueue;
use crate::resync::SymbolDiff;
use crate::stats::PipelineStats;
use crate::traits::FeedConnector;

const COMMAND_BUFFER: usize = 64;
const SHARD_COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy)]
struct SymbolEntry {
    state: SubscriptionState,
    shard: usize,
}

struct ShardHandle {
    tx: mpsc::Sender<ShardCommand>,
    count: usize,
    task: JoinHandle<()>,
}

/// Assign each symbol to the least-loaded shard with room, opening new shard
/// ids past `next_id` when all are full
fn plan_assignments(
    counts: &mut BTreeMap<usize, usize>,
    next_id: &mut usize,
    max_per_shard: usize,
    symbols: impl IntoIterator<Item = String>,
) -> BTreeMap<usize, Vec<String>> {
    let mut plan: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for symbol in symbols {
        let target = counts
            .iter()
            .filter(|(_, &count)| count < max_per_shard)
            .min_by_key(|(&id, &count)| (count, id))
            .map(|(&id, _)| id);
        let id = target.unwrap_or_else(|| {
            let id = *next_id;
            *next_id += 1;
            id
        });
        *counts.entry(id).or_insert(0) += 1;
        plan.entry(id).or_default().push(symbol);
    }
    plan
}

pub struct FeedConsumer<C: FeedConnector> {
    connector: Arc<C>,
    settings: ShardSettings,
    max_per_shard: usize,
    queue: Arc<IngestQueue>,
    stats: Arc<PipelineStats>,
    commands: mpsc::Receiver<FeedCommand>,
    events_tx: mpsc::UnboundedSender<ShardEvent>,
    events_rx: mpsc::UnboundedReceiver<ShardEvent>,
    symbols: BTreeMap<String, SymbolEntry>,
    shards: BTreeMap<usize, ShardHandle>,
    /// Closed shards still winding down
    retired: Vec<JoinHandle<()>>,
    next_shard_id: usize,
}

impl<C: FeedConnector> FeedConsumer<C> {
    pub fn new(
        connector: C,
        config: &PipelineConfig,
        queue: Arc<IngestQueue>,
        stats: Arc<PipelineStats>,
    ) -> (Self, FeedHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let consumer = Self {
            connector: Arc::new(connector),
            settings: ShardSettings::from(config),
            max_per_shard: config.max_symbols_per_shard.max(1),
            queue,
            stats,
            commands: rx,
            events_tx,
            events_rx,
            symbols: BTreeMap::new(),
            shards: BTreeMap::new(),
            retired: Vec::new(),
            next_shard_id: 0,
        };
        (consumer, FeedHandle::new(tx))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(max_per_shard = self.max_per_shard, "Feed consumer started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(FeedCommand::Apply(diff)) => self.apply(diff, &shutdown).await,
                    Some(FeedCommand::Snapshot(reply)) => {
                        let _ = reply.send(self.symbols.keys().cloned().collect::<BTreeSet<_>>());
                    }
                    Some(FeedCommand::States(reply)) => {
                        let states = self
                            .symbols
                            .iter()
                            .map(|(symbol, entry)| (symbol.clone(), entry.state))
                            .collect();
                        let _ = reply.send(states);
                    }
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.on_shard_event(event),
            }
        }

        self.stop().await;
    }

    async fn apply(&mut self, diff: SymbolDiff, shutdown: &watch::Receiver<bool>) {
        let mut counts: BTreeMap<usize, usize> =
            self.shards.iter().map(|(&id, s)| (id, s.count)).collect();

        // Removals first so freed room is reused by additions
        let mut removals: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for symbol in diff.removed {
            if let Some(entry) = self.symbols.remove(&symbol) {
                if let Some(count) = counts.get_mut(&entry.shard) {
                    *count = count.saturating_sub(1);
                }
                removals.entry(entry.shard).or_default().push(symbol);
            }
        }

        let added: Vec<String> = diff
            .added
            .into_iter()
            .filter(|s| !self.symbols.contains_key(s))
            .collect();
        let mut next_id = self.next_shard_id;
        let additions = plan_assignments(&mut counts, &mut next_id, self.max_per_shard, added);
        self.next_shard_id = next_id;

        for (&shard, symbols) in &additions {
            for symbol in symbols {
                self.symbols.insert(
                    symbol.clone(),
                    SymbolEntry {
                        state: SubscriptionState::Pending,
                        shard,
                    },
                );
            }
        }

        for (id, symbols) in additions {
            if self.shards.contains_key(&id) {
                self.send(id, ShardCommand::Subscribe(symbols)).await;
            } else {
                self.spawn_shard(id, symbols, shutdown);
            }
        }

        for (id, symbols) in removals {
            if counts.get(&id).copied().unwrap_or(0) == 0 {
                self.close_shard(id);
            } else {
                self.send(id, ShardCommand::Unsubscribe(symbols)).await;
            }
        }

        for (id, count) in counts {
            if let Some(shard) = self.shards.get_mut(&id) {
                shard.count = count;
            }
        }

        self.stats.set_subscribed_symbols(self.symbols.len());
        info!(
            symbols = self.symbols.len(),
            shards = self.shards.len(),
            "Subscription set updated"
        );
    }

    async fn send(&mut self, id: usize, command: ShardCommand) {
        if let Some(shard) = self.shards.get(&id) {
            if shard.tx.send(command).await.is_err() {
                warn!(shard = id, "Shard command channel closed");
            }
        }
    }

    fn spawn_shard(&mut self, id: usize, symbols: Vec<String>, shutdown: &watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel(SHARD_COMMAND_BUFFER);
        let count = symbols.len();
        let worker = ShardWorker::new(
            id,
            Arc::clone(&self.connector),
            self.settings.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.stats),
            rx,
            self.events_tx.clone(),
            symbols.into_iter().collect(),
        );
        let task = tokio::spawn(worker.run(shutdown.clone()));
        info!(shard = id, symbols = count, "Spawned feed shard");
        self.shards.insert(id, ShardHandle { tx, count, task });
    }

    fn close_shard(&mut self, id: usize) {
        if let Some(shard) = self.shards.remove(&id) {
            info!(shard = id, "Closing empty shard");
            if shard.tx.try_send(ShardCommand::Close).is_err() {
                shard.task.abort();
            }
            self.retired.push(shard.task);
        }
    }

    fn on_shard_event(&mut self, event: ShardEvent) {
        match event {
            ShardEvent::Acked { shard, symbols } => {
                for symbol in symbols {
                    if let Some(entry) = self.symbols.get_mut(&symbol) {
                        if entry.shard == shard {
                            entry.state = SubscriptionState::Active;
                        }
                    }
                }
            }
            ShardEvent::Disconnected { shard } => {
                let mut stale = 0;
                for entry in self.symbols.values_mut() {
                    if entry.shard == shard && entry.state == SubscriptionState::Active {
                        entry.state = SubscriptionState::Stale;
                        stale += 1;
                    }
                }
                debug!(shard, stale, "Shard disconnected");
            }
        }
    }

    async fn stop(&mut self) {
        info!(shards = self.shards.len(), "Stopping feed consumer");
        let shards = std::mem::take(&mut self.shards);
        let mut tasks: Vec<JoinHandle<()>> = std::mem::take(&mut self.retired);
        for (_, shard) in shards {
            let _ = shard.tx.try_send(ShardCommand::Close);
            tasks.push(shard.task);
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Shard task failed");
                }
            }
        }
        info!("Feed consumer stopped");
    }
}
