//! Pipeline configuration
//!
//! Built once at startup (YAML file and/or CLI) and handed to each component
//! constructor. Durations are expressed in milliseconds in YAML.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

pub const BYBIT_WS_URL: &str = "wss://stream.bybit.com/v5/public/option";
pub const BYBIT_REST_URL: &str = "https://api.bybit.com";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued record to admit the new one
    #[default]
    DropOldest,
    /// Refuse the new record
    DropNewest,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    #[serde(rename = "max_circuit_open_ms", with = "duration_ms")]
    pub max_circuit_open: Duration,
    pub max_queue_fill: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_circuit_open: Duration::from_secs(300),
            max_queue_fill: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base coins whose option chains are ingested
    pub assets: Vec<String>,
    pub ws_url: String,
    pub rest_url: String,

    pub batch_size: usize,
    #[serde(rename = "batch_timeout_ms", with = "duration_ms")]
    pub batch_timeout: Duration,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,

    pub max_retries: u32,
    #[serde(rename = "retry_base_delay_ms", with = "duration_ms")]
    pub retry_base_delay: Duration,
    #[serde(rename = "retry_max_delay_ms", with = "duration_ms")]
    pub retry_max_delay: Duration,
    pub failure_threshold: u32,
    #[serde(rename = "circuit_recovery_timeout_ms", with = "duration_ms")]
    pub circuit_recovery_timeout: Duration,

    #[serde(rename = "resync_interval_ms", with = "duration_ms")]
    pub resync_interval: Duration,
    pub discovery_max_attempts: u32,

    pub subscription_chunk_size: usize,
    pub max_symbols_per_shard: usize,
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(rename = "heartbeat_timeout_ms", with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    #[serde(rename = "subscribe_ack_timeout_ms", with = "duration_ms")]
    pub subscribe_ack_timeout: Duration,
    pub subscribe_chunk_attempts: u32,
    #[serde(rename = "reconnect_initial_delay_ms", with = "duration_ms")]
    pub reconnect_initial_delay: Duration,
    #[serde(rename = "reconnect_max_delay_ms", with = "duration_ms")]
    pub reconnect_max_delay: Duration,
    #[serde(rename = "reconnect_reset_after_ms", with = "duration_ms")]
    pub reconnect_reset_after: Duration,

    #[serde(rename = "shutdown_grace_ms", with = "duration_ms")]
    pub shutdown_grace: Duration,
    #[serde(rename = "stats_interval_ms", with = "duration_ms")]
    pub stats_interval: Duration,
    pub health: HealthThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            assets: vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()],
            ws_url: BYBIT_WS_URL.to_string(),
            rest_url: BYBIT_REST_URL.to_string(),
            batch_size: 200,
            batch_timeout: Duration::from_millis(500),
            queue_capacity: 5000,
            overflow_policy: OverflowPolicy::DropOldest,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            failure_threshold: 5,
            circuit_recovery_timeout: Duration::from_secs(30),
            resync_interval: Duration::from_secs(24 * 60 * 60),
            discovery_max_attempts: 3,
            subscription_chunk_size: 10,
            max_symbols_per_shard: 500,
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            subscribe_ack_timeout: Duration::from_secs(10),
            subscribe_chunk_attempts: 3,
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_reset_after: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            stats_interval: Duration::from_secs(30),
            health: HealthThresholds::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a YAML file; keys not present keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("batch_size", self.batch_size),
            ("queue_capacity", self.queue_capacity),
            ("subscription_chunk_size", self.subscription_chunk_size),
            ("max_symbols_per_shard", self.max_symbols_per_shard),
            ("failure_threshold", self.failure_threshold as usize),
            ("discovery_max_attempts", self.discovery_max_attempts as usize),
            ("subscribe_chunk_attempts", self.subscribe_chunk_attempts as usize),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }

        let durations = [
            ("batch_timeout", self.batch_timeout),
            ("retry_base_delay", self.retry_base_delay),
            ("retry_max_delay", self.retry_max_delay),
            ("circuit_recovery_timeout", self.circuit_recovery_timeout),
            ("resync_interval", self.resync_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("subscribe_ack_timeout", self.subscribe_ack_timeout),
            ("reconnect_initial_delay", self.reconnect_initial_delay),
            ("reconnect_max_delay", self.reconnect_max_delay),
            ("stats_interval", self.stats_interval),
            ("health.max_circuit_open", self.health.max_circuit_open),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }

        if self.retry_max_delay < self.retry_base_delay {
            return Err(ConfigError::Invalid(
                "retry_max_delay must not be below retry_base_delay".to_string(),
            ));
        }
        if self.reconnect_max_delay < self.reconnect_initial_delay {
            return Err(ConfigError::Invalid(
                "reconnect_max_delay must not be below reconnect_initial_delay".to_string(),
            ));
        }
        let fill = self.health.max_queue_fill;
        if !(fill > 0.0 && fill <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "health.max_queue_fill must be in (0, 1], got {}",
                fill
            )));
        }
        if self.assets.iter().all(|a| a.trim().is_empty()) {
            return Err(ConfigError::Invalid("at least one asset is required".to_string()));
        }
        url::Url::parse(&self.ws_url)
            .map_err(|e| ConfigError::Invalid(format!("ws_url {}: {}", self.ws_url, e)))?;
        url::Url::parse(&self.rest_url)
            .map_err(|e| ConfigError::Invalid(format!("rest_url {}: {}", self.rest_url, e)))?;
        Ok(())
    }

    /// Upper-cased, deduplicated asset list in configured order
    pub fn normalized_assets(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for asset in &self.assets {
            let asset = asset.trim().to_ascii_uppercase();
            if !asset.is_empty() && !out.contains(&asset) {
                out.push(asset);
            }
        }
        out
    }
}
