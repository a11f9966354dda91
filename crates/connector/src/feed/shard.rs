//! One feed connection multiplexing a slice of the symbol set
//!
//! ```text
//! Disconnected -> Connecting -> Subscribing -> Streaming
//!      ^              ^                          |    ^
//!      |              |                          v    |
//!      +--------------+------ resubscribe --- Degraded
//!                             failed
//! ```
//!
//! Degraded is entered on a malformed frame or a missed heartbeat. The shard
//! resubscribes in place and pings; a pong brings it back to Streaming,
//! anything else forces a full reconnect.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::{ReconnectConfig, ReconnectPolicy};
use crate::config::PipelineConfig;
use crate::error::FeedError;
use crate::message::{FeedEvent, SubscribeAck};
use crate::queue::IngestQueue;
use crate::stats::PipelineStats;
use crate::traits::{FeedConnection, FeedConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribing,
    Streaming,
    Degraded,
}

#[derive(Debug)]
pub(crate) enum ShardCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Close,
}

/// Reported back to the consumer, which owns the symbol states
#[derive(Debug)]
pub(crate) enum ShardEvent {
    Acked { shard: usize, symbols: Vec<String> },
    Disconnected { shard: usize },
}

#[derive(Debug, Clone)]
pub(crate) struct ShardSettings {
    pub chunk_size: usize,
    pub chunk_attempts: u32,
    pub ack_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl From<&PipelineConfig> for ShardSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            chunk_size: config.subscription_chunk_size.max(1),
            chunk_attempts: config.subscribe_chunk_attempts.max(1),
            ack_timeout: config.subscribe_ack_timeout,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            reconnect: ReconnectConfig {
                initial_delay: config.reconnect_initial_delay,
                max_delay: config.reconnect_max_delay,
                reset_after: config.reconnect_reset_after,
                ..Default::default()
            },
        }
    }
}

enum SessionEnd {
    Reconnect,
    Closed,
    Shutdown,
}

pub(crate) struct ShardWorker<C: FeedConnector> {
    id: usize,
    connector: Arc<C>,
    settings: ShardSettings,
    queue: Arc<IngestQueue>,
    stats: Arc<PipelineStats>,
    commands: mpsc::Receiver<ShardCommand>,
    events: mpsc::UnboundedSender<ShardEvent>,
    /// Symbols this shard is responsible for
    symbols: BTreeSet<String>,
    /// Symbols acknowledged on the current connection
    active: BTreeSet<String>,
    backoff: ReconnectPolicy,
    state: ConnectionState,
    req_seq: u64,
    last_pong: Instant,
    connect_attempts: u64,
}

impl<C: FeedConnector> ShardWorker<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        connector: Arc<C>,
        settings: ShardSettings,
        queue: Arc<IngestQueue>,
        stats: Arc<PipelineStats>,
        commands: mpsc::Receiver<ShardCommand>,
        events: mpsc::UnboundedSender<ShardEvent>,
        symbols: BTreeSet<String>,
    ) -> Self {
        let backoff = ReconnectPolicy::new(settings.reconnect.clone());
        Self {
            id,
            connector,
            settings,
            queue,
            stats,
            commands,
            events,
            symbols,
            active: BTreeSet::new(),
            backoff,
            state: ConnectionState::Disconnected,
            req_seq: 0,
            last_pong: Instant::now(),
            connect_attempts: 0,
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(shard = self.id, symbols = self.symbols.len(), "Shard started");

        loop {
            let mut conn = match self.connect(&mut shutdown).await {
                Some(conn) => conn,
                None => break,
            };

            self.stats.connection_opened();
            let end = match self.session(&mut conn, &mut shutdown).await {
                Ok(end) => end,
                Err(FeedError::ShuttingDown) => SessionEnd::Shutdown,
                Err(e) => {
                    warn!(shard = self.id, error = %e, "Shard connection lost");
                    SessionEnd::Reconnect
                }
            };
            self.stats.connection_closed();
            self.active.clear();
            self.set_state(ConnectionState::Disconnected);
            let _ = self.events.send(ShardEvent::Disconnected { shard: self.id });

            match end {
                SessionEnd::Reconnect => {
                    let delay = self.backoff.next_delay();
                    info!(shard = self.id, delay_ms = delay.as_millis() as u64, "Reconnecting shard");
                    if !self.wait_offline(delay, &mut shutdown).await {
                        break;
                    }
                }
                SessionEnd::Closed | SessionEnd::Shutdown => {
                    if let Err(e) = conn.close().await {
                        debug!(shard = self.id, error = %e, "Error closing feed connection");
                    }
                    break;
                }
            }
        }

        info!(shard = self.id, "Shard stopped");
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(shard = self.id, from = ?self.state, to = ?state, "Shard state");
            self.state = state;
        }
    }

    fn next_req_id(&mut self, prefix: &str) -> String {
        self.req_seq += 1;
        format!("{}{}-{}", prefix, self.id, self.req_seq)
    }

    /// Connect with backoff. None on shutdown or close.
    async fn connect(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<C::Connection> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            self.set_state(ConnectionState::Connecting);
            if self.connect_attempts > 0 {
                self.stats.record_reconnect();
            }
            self.connect_attempts += 1;

            let result = tokio::select! {
                result = self.connector.connect() => result,
                _ = shutdown.changed() => return None,
            };

            match result {
                Ok(conn) => {
                    info!(shard = self.id, attempt = self.connect_attempts, "Shard connected");
                    return Some(conn);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        shard = self.id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Shard connect failed"
                    );
                    if !self.wait_offline(delay, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep out a backoff delay while still tracking symbol changes.
    /// Returns false when the shard should stop.
    async fn wait_offline(&mut self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                _ = shutdown.changed() => return false,
                cmd = self.commands.recv() => match cmd {
                    Some(ShardCommand::Subscribe(symbols)) => self.symbols.extend(symbols),
                    Some(ShardCommand::Unsubscribe(symbols)) => {
                        for s in &symbols {
                            self.symbols.remove(s);
                        }
                    }
                    Some(ShardCommand::Close) | None => return false,
                },
            }
        }
    }

    async fn session(
        &mut self,
        conn: &mut C::Connection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, FeedError> {
        let connected_at = Instant::now();
        self.last_pong = connected_at;

        self.set_state(ConnectionState::Subscribing);
        let symbols: Vec<String> = self.symbols.iter().cloned().collect();
        let acked = self.subscribe_chunks(conn, &symbols, shutdown).await?;
        info!(shard = self.id, requested = symbols.len(), acked, "Shard subscribed");
        self.set_state(ConnectionState::Streaming);

        let period = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),

                cmd = self.commands.recv() => match cmd {
                    Some(ShardCommand::Subscribe(symbols)) => {
                        let new: Vec<String> = symbols
                            .into_iter()
                            .filter(|s| self.symbols.insert(s.clone()))
                            .collect();
                        self.subscribe_chunks(conn, &new, shutdown).await?;
                    }
                    Some(ShardCommand::Unsubscribe(symbols)) => {
                        for s in &symbols {
                            self.symbols.remove(s);
                            self.active.remove(s);
                        }
                        self.unsubscribe_chunks(conn, &symbols, shutdown).await?;
                    }
                    Some(ShardCommand::Close) | None => return Ok(SessionEnd::Closed),
                },

                event = conn.recv() => {
                    if !self.handle_event(event?) {
                        self.recover(conn, "malformed frame", shutdown).await?;
                    }
                }

                _ = heartbeat.tick() => {
                    let now = Instant::now();
                    if now.saturating_duration_since(self.last_pong) > self.settings.heartbeat_timeout {
                        self.recover(conn, "heartbeat timeout", shutdown).await?;
                        continue;
                    }

                    let req_id = self.next_req_id("p");
                    conn.ping(&req_id).await?;
                    if self.backoff.observe_connected_for(now.saturating_duration_since(connected_at)) {
                        debug!(shard = self.id, "Reconnect backoff reset");
                    }

                    let pending: Vec<String> = self.symbols.difference(&self.active).cloned().collect();
                    if !pending.is_empty() {
                        debug!(shard = self.id, pending = pending.len(), "Retrying pending subscriptions");
                        self.subscribe_chunks(conn, &pending, shutdown).await?;
                    }
                }
            }
        }
    }

    /// Returns false for a malformed frame
    fn handle_event(&mut self, event: FeedEvent) -> bool {
        match event {
            FeedEvent::Quotes(records) => {
                self.stats.record_received(records.len() as u64);
                for record in records {
                    self.queue.push(record);
                }
                true
            }
            FeedEvent::Pong => {
                self.last_pong = Instant::now();
                true
            }
            FeedEvent::Ack(ack) => {
                debug!(shard = self.id, req_id = ?ack.req_id, success = ack.success, "Unmatched ack");
                true
            }
            FeedEvent::Malformed(reason) => {
                self.stats.record_parse_error();
                warn!(shard = self.id, reason = %reason, "Discarding malformed frame");
                false
            }
            FeedEvent::Ignored => true,
        }
    }

    /// Degraded: resubscribe in place and ping. Err forces a reconnect.
    async fn recover(
        &mut self,
        conn: &mut C::Connection,
        reason: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), FeedError> {
        self.set_state(ConnectionState::Degraded);
        warn!(shard = self.id, reason, "Shard degraded, resubscribing in place");

        let since = Instant::now();
        let req_id = self.next_req_id("p");
        conn.ping(&req_id).await?;
        let symbols: Vec<String> = self.symbols.iter().cloned().collect();
        self.subscribe_chunks(conn, &symbols, shutdown).await?;

        if !self.await_pong(conn, since, shutdown).await? {
            return Err(FeedError::ConnectionFailed(format!(
                "shard {} did not recover from {}",
                self.id, reason
            )));
        }
        info!(shard = self.id, "Shard recovered");
        self.set_state(ConnectionState::Streaming);
        Ok(())
    }

    async fn await_pong(
        &mut self,
        conn: &mut C::Connection,
        since: Instant,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, FeedError> {
        let deadline = Instant::now() + self.settings.ack_timeout;
        while self.last_pong < since {
            match recv_until(conn, deadline, shutdown).await? {
                None => return Ok(false),
                Some(event) => {
                    self.handle_event(event);
                }
            }
        }
        Ok(true)
    }

    /// Subscribe in chunks, each waiting for its ack. A chunk that fails every
    /// attempt stays pending for the next heartbeat. Returns acked count.
    async fn subscribe_chunks(
        &mut self,
        conn: &mut C::Connection,
        symbols: &[String],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<usize, FeedError> {
        let mut acked = 0;
        for chunk in symbols.chunks(self.settings.chunk_size) {
            let mut attempt = 0;
            loop {
                attempt += 1;
                let req_id = self.next_req_id("s");
                conn.subscribe(&req_id, chunk).await?;

                let reason = match self.await_ack(conn, &req_id, shutdown).await? {
                    Some(ack) if ack.success || ack.ret_msg.contains("already subscribed") => {
                        self.active.extend(chunk.iter().cloned());
                        acked += chunk.len();
                        let _ = self.events.send(ShardEvent::Acked {
                            shard: self.id,
                            symbols: chunk.to_vec(),
                        });
                        break;
                    }
                    Some(ack) => ack.ret_msg,
                    None => "ack timeout".to_string(),
                };

                if attempt >= self.settings.chunk_attempts {
                    warn!(
                        shard = self.id,
                        req_id = %req_id,
                        symbols = chunk.len(),
                        reason = %reason,
                        "Subscribe chunk failed, symbols stay pending"
                    );
                    break;
                }
                debug!(shard = self.id, req_id = %req_id, attempt, reason = %reason, "Retrying subscribe chunk");
            }
        }
        Ok(acked)
    }

    async fn unsubscribe_chunks(
        &mut self,
        conn: &mut C::Connection,
        symbols: &[String],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), FeedError> {
        for chunk in symbols.chunks(self.settings.chunk_size) {
            let req_id = self.next_req_id("u");
            conn.unsubscribe(&req_id, chunk).await?;
            match self.await_ack(conn, &req_id, shutdown).await? {
                Some(ack) if ack.success => {}
                Some(ack) => {
                    warn!(shard = self.id, req_id = %req_id, ret_msg = %ack.ret_msg, "Unsubscribe refused")
                }
                None => warn!(shard = self.id, req_id = %req_id, "Unsubscribe ack timeout"),
            }
        }
        Ok(())
    }

    /// Wait for the ack of `req_id`, processing everything else that arrives
    async fn await_ack(
        &mut self,
        conn: &mut C::Connection,
        req_id: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<SubscribeAck>, FeedError> {
        let deadline = Instant::now() + self.settings.ack_timeout;
        loop {
            let event = match recv_until(conn, deadline, shutdown).await? {
                None => return Ok(None),
                Some(event) => event,
            };
            match event {
                FeedEvent::Ack(ack) if ack.req_id.as_deref().map_or(true, |id| id == req_id) => {
                    return Ok(Some(ack));
                }
                other => {
                    self.handle_event(other);
                }
            }
        }
    }
}

/// Next event before `deadline`, None on timeout. Shutdown interrupts the wait.
async fn recv_until<T: FeedConnection>(
    conn: &mut T,
    deadline: Instant,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<FeedEvent>, FeedError> {
    if *shutdown.borrow() {
        return Err(FeedError::ShuttingDown);
    }
    tokio::select! {
        result = tokio::time::timeout_at(deadline, conn.recv()) => match result {
            Err(_) => Ok(None),
            Ok(event) => event.map(Some),
        },
        _ = shutdown.changed() => Err(FeedError::ShuttingDown),
    }
}
