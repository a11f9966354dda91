//! Feed consumer: owns the symbol set and the shard connections
//!
//! The consumer task is the only writer of the symbol set. Other components
//! talk to it through a `FeedHandle`.

mod consumer;
mod shard;

pub use consumer::FeedConsumer;
pub use shard::ConnectionState;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{mpsc, oneshot};

use crate::error::FeedError;
use crate::resync::SymbolDiff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Requested, not yet acknowledged
    Pending,
    /// Acknowledged by the venue
    Active,
    /// Owning shard lost its connection; active again after resubscribe
    Stale,
}

pub enum FeedCommand {
    Apply(SymbolDiff),
    Snapshot(oneshot::Sender<BTreeSet<String>>),
    States(oneshot::Sender<BTreeMap<String, SubscriptionState>>),
}

/// Cloneable command handle into the consumer task
#[derive(Clone)]
pub struct FeedHandle {
    tx: mpsc::Sender<FeedCommand>,
}

impl FeedHandle {
    pub(crate) fn new(tx: mpsc::Sender<FeedCommand>) -> Self {
        Self { tx }
    }

    pub async fn apply(&self, diff: SymbolDiff) -> Result<(), FeedError> {
        self.tx
            .send(FeedCommand::Apply(diff))
            .await
            .map_err(|_| FeedError::ConsumerStopped)
    }

    /// Current symbol set, every state included
    pub async fn snapshot(&self) -> Result<BTreeSet<String>, FeedError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(FeedCommand::Snapshot(tx))
            .await
            .map_err(|_| FeedError::ConsumerStopped)?;
        rx.await.map_err(|_| FeedError::ConsumerStopped)
    }

    pub async fn states(&self) -> Result<BTreeMap<String, SubscriptionState>, FeedError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(FeedCommand::States(tx))
            .await
            .map_err(|_| FeedError::ConsumerStopped)?;
        rx.await.map_err(|_| FeedError::ConsumerStopped)
    }
}
