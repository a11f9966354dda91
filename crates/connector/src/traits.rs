use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::{DiscoveryError, FeedError};
use crate::message::FeedEvent;

/// Opens feed connections. One connection per shard.
#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    type Connection: FeedConnection + 'static;

    async fn connect(&self) -> Result<Self::Connection, FeedError>;
}

/// A single streaming connection multiplexing many symbols
#[async_trait]
pub trait FeedConnection: Send {
    /// Send a subscribe request; the reply arrives later as `FeedEvent::Ack`
    async fn subscribe(&mut self, req_id: &str, symbols: &[String]) -> Result<(), FeedError>;

    async fn unsubscribe(&mut self, req_id: &str, symbols: &[String]) -> Result<(), FeedError>;

    /// Application-level heartbeat; answered by `FeedEvent::Pong`
    async fn ping(&mut self, req_id: &str) -> Result<(), FeedError>;

    /// Next decoded frame. Transport-level ping/pong is handled internally.
    async fn recv(&mut self) -> Result<FeedEvent, FeedError>;

    async fn close(&mut self) -> Result<(), FeedError>;
}

/// Source of the tradable symbol universe
#[async_trait]
pub trait SymbolDirectory: Send + Sync {
    /// Upper-cased, deduplicated identifiers
    async fn discover(&self) -> Result<BTreeSet<String>, DiscoveryError>;
}
