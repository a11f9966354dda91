use thiserror::Error;

/// Transport failures on a feed connection. Always recovered by reconnecting.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection closed")]
    Closed,
    #[error("read timeout after {0} seconds")]
    ReadTimeout(u64),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("feed consumer stopped")]
    ConsumerStopped,
    /// Shutdown arrived while a request was outstanding
    #[error("shutting down")]
    ShuttingDown,
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} for {coin}")]
    Status { coin: String, status: u16 },
    #[error("venue error {code} for {coin}: {message}")]
    Venue {
        coin: String,
        code: i64,
        message: String,
    },
    #[error("JSON parse error: {0}")]
    Json(String),
    #[error("discovery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Startup failures; everything after startup is counted and recovered
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("initial discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Feed(#[from] FeedError),
}
