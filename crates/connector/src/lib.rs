//! optfeed-connector: Option ticker ingestion runtime
//!
//! Subscribes to the Bybit option ticker stream across sharded WebSocket
//! connections, buffers records in a bounded queue and batch-writes them to a
//! `QuoteStore` behind retry and circuit breaker logic.

pub mod backoff;
pub mod bybit;
pub mod circuit;
pub mod config;
pub mod error;
pub mod feed;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod resync;
pub mod server;
pub mod stats;
pub mod traits;
pub mod writer;

pub use bybit::{BybitConnector, BybitSymbolDirectory};
pub use circuit::{CircuitBreaker, CircuitState};
pub use config::{HealthThresholds, OverflowPolicy, PipelineConfig};
pub use error::{ConfigError, DiscoveryError, FeedError, PipelineError};
pub use feed::{FeedConsumer, FeedHandle, SubscriptionState};
pub use message::{FeedEvent, SubscribeAck};
pub use pipeline::{Pipeline, RunningPipeline};
pub use queue::IngestQueue;
pub use resync::{ResyncScheduler, SymbolDiff};
pub use server::{create_router, run_server, ServerState};
pub use stats::{HealthStatus, PipelineStats, StatsReporter, StatsSink, StatsSnapshot, StoreStatsSink};
pub use traits::{FeedConnection, FeedConnector, SymbolDirectory};
pub use writer::{BatchWriter, BatchWriterConfig};
