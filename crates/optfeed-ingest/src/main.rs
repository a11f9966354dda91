//! optfeed-ingest: Option ticker ingestion binary
//!
//! Discovers live Bybit option symbols, streams their tickers and keeps the
//! latest quote per option in Redis.

mod cli;
mod shutdown;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use optfeed_connector::{
    run_server, BybitConnector, BybitSymbolDirectory, Pipeline, ServerState,
};
use optfeed_middleware::RedisQuoteStore;

use cli::Args;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,optfeed=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Err(e) = run(args).await {
        error!(error = %format!("{:#}", e), "optfeed-ingest failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args
        .pipeline_config()
        .context("invalid configuration")?;
    let assets = config.normalized_assets();

    info!(
        redis_url = %args.redis_url,
        ws_url = %config.ws_url,
        assets = ?assets,
        batch_size = config.batch_size,
        queue_capacity = config.queue_capacity,
        "optfeed-ingest starting"
    );

    let store = RedisQuoteStore::connect(&args.redis_url)
        .await
        .context("failed to connect to Redis")?;

    let directory = BybitSymbolDirectory::new(config.rest_url.clone(), assets)
        .context("failed to build discovery client")?
        .with_retry(
            config.discovery_max_attempts,
            config.retry_base_delay,
            config.retry_max_delay,
        );

    // Pings keep the socket chatty; silence past the heartbeat timeout is a dead link
    let connector = BybitConnector::new(config.ws_url.clone(), config.heartbeat_timeout);

    let thresholds = config.health.clone();
    let pipeline = Pipeline::start(config, connector, Arc::new(directory), Arc::new(store))
        .await
        .context("failed to start pipeline")?;

    let (server_tx, server_rx) = watch::channel(false);
    let server_state = ServerState::new(pipeline.stats(), thresholds);
    let listen_addr = args.listen_addr;
    let server = tokio::spawn(async move {
        if let Err(e) = run_server(listen_addr, server_state, server_rx).await {
            error!(error = %e, addr = %listen_addr, "Health server failed");
        }
    });

    shutdown::shutdown_signal().await;
    info!("Shutting down");

    let snapshot = pipeline.shutdown().await;
    let c = &snapshot.counters;
    info!(
        received = c.received,
        enqueued = c.enqueued,
        written = c.written,
        dropped = c.dropped,
        failed = c.failed,
        rejected = c.rejected,
        "Pipeline stopped"
    );

    let _ = server_tx.send(true);
    if let Err(e) = server.await {
        warn!(error = %e, "Health server task panicked");
    }

    info!("optfeed-ingest stopped");
    Ok(())
}
