//! In-memory implementations for testing
pub mod store;

pub use store::InMemoryQuoteStore;
