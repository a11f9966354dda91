//! optfeed-middleware: Pluggable persistence for option quotes
//!
//! Provides the `QuoteStore` abstraction with an in-memory implementation for
//! testing and a Redis implementation behind the `redis-store` feature.

pub mod codec;
pub mod error;
pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod store;

pub use error::StoreError;
pub use memory::InMemoryQuoteStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisQuoteStore;
pub use store::{QuoteStore, RejectedRecord, StatsSummary, WriteOutcome};
