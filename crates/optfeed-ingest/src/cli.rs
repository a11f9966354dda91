use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use optfeed_connector::{ConfigError, OverflowPolicy, PipelineConfig};

/// optfeed-ingest: Bybit option tickers → Redis
#[derive(Parser, Debug)]
#[command(name = "optfeed-ingest")]
#[command(about = "Ingest the Bybit option ticker stream into Redis")]
pub struct Args {
    /// YAML pipeline configuration; flags and env vars below override it
    #[arg(short, long, env = "OPTFEED_CONFIG")]
    pub config: Option<PathBuf>,

    /// Redis server URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Bybit public option WebSocket endpoint
    #[arg(long, env = "BYBIT_WS_URL")]
    pub ws_url: Option<String>,

    /// Bybit REST base URL for instrument discovery
    #[arg(long, env = "BYBIT_REST_URL")]
    pub rest_url: Option<String>,

    /// Comma-separated base coins (e.g. BTC,ETH,SOL)
    #[arg(long, env = "OPTFEED_ASSETS", value_delimiter = ',')]
    pub assets: Option<Vec<String>>,

    /// Health/metrics listen address
    #[arg(long, env = "OPTFEED_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    #[arg(long, env = "OPTFEED_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    #[arg(long, env = "OPTFEED_BATCH_TIMEOUT_MS")]
    pub batch_timeout_ms: Option<u64>,

    #[arg(long, env = "OPTFEED_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// drop_oldest or drop_newest
    #[arg(long, env = "OPTFEED_OVERFLOW_POLICY", value_parser = parse_overflow_policy)]
    pub overflow_policy: Option<OverflowPolicy>,

    #[arg(long, env = "OPTFEED_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    #[arg(long, env = "OPTFEED_FAILURE_THRESHOLD")]
    pub failure_threshold: Option<u32>,

    #[arg(long, env = "OPTFEED_CIRCUIT_RECOVERY_MS")]
    pub circuit_recovery_ms: Option<u64>,

    #[arg(long, env = "OPTFEED_RESYNC_INTERVAL_SECS")]
    pub resync_interval_secs: Option<u64>,

    #[arg(long, env = "OPTFEED_MAX_SYMBOLS_PER_SHARD")]
    pub max_symbols_per_shard: Option<usize>,

    #[arg(long, env = "OPTFEED_SUBSCRIPTION_CHUNK_SIZE")]
    pub subscription_chunk_size: Option<usize>,

    /// Emit logs as JSON lines
    #[arg(long, env = "OPTFEED_LOG_JSON")]
    pub log_json: bool,
}

fn parse_overflow_policy(s: &str) -> Result<OverflowPolicy, String> {
    match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "drop_oldest" => Ok(OverflowPolicy::DropOldest),
        "drop_newest" => Ok(OverflowPolicy::DropNewest),
        other => Err(format!("unknown overflow policy: {}", other)),
    }
}

impl Args {
    /// Base config from `--config` (or defaults) with flag/env overrides applied
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(url) = &self.ws_url {
            config.ws_url = url.clone();
        }
        if let Some(url) = &self.rest_url {
            config.rest_url = url.clone();
        }
        if let Some(assets) = &self.assets {
            config.assets = assets.clone();
        }
        if let Some(n) = self.batch_size {
            config.batch_size = n;
        }
        if let Some(ms) = self.batch_timeout_ms {
            config.batch_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.queue_capacity {
            config.queue_capacity = n;
        }
        if let Some(policy) = self.overflow_policy {
            config.overflow_policy = policy;
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(n) = self.failure_threshold {
            config.failure_threshold = n;
        }
        if let Some(ms) = self.circuit_recovery_ms {
            config.circuit_recovery_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = self.resync_interval_secs {
            config.resync_interval = Duration::from_secs(secs);
        }
        if let Some(n) = self.max_symbols_per_shard {
            config.max_symbols_per_shard = n;
        }
        if let Some(n) = self.subscription_chunk_size {
            config.subscription_chunk_size = n;
        }

        config.validate()?;
        Ok(config)
    }
}
