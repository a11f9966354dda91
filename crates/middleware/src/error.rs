use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Worth retrying: timeouts, dropped connections, busy/loading server
    #[error("transient store error: {0}")]
    Transient(String),
    /// Retrying will not help: bad credentials, script errors, wrong types
    #[error("permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}
