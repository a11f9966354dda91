//! Scripted feed connector for integration tests.
//!
//! Every connection auto-acks subscribe/unsubscribe requests and answers
//! pings, records what it was asked to do, and delivers events injected
//! through `ScriptedConnector::inject`.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::TimeZone;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use optfeed_connector::{
    DiscoveryError, FeedConnection, FeedConnector, FeedError, FeedEvent, SubscribeAck,
    SymbolDirectory,
};
use optfeed_schema::{OptionSymbol, QuoteRecord};

pub enum Script {
    Event(FeedEvent),
    Drop,
}

#[derive(Default)]
struct Shared {
    connects: AtomicUsize,
    fail_connects: AtomicUsize,
    silent_pings: AtomicBool,
    silent_acks: AtomicBool,
    rejected: Mutex<BTreeSet<String>>,
    subscribes: Mutex<Vec<Vec<String>>>,
    unsubscribes: Mutex<Vec<Vec<String>>>,
    pings: AtomicUsize,
    live: Mutex<Vec<mpsc::UnboundedSender<Script>>>,
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    shared: Arc<Shared>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event on every live connection
    pub fn inject(&self, event: FeedEvent) {
        let live = self.shared.live.lock().unwrap();
        for tx in live.iter() {
            let _ = tx.send(Script::Event(event.clone()));
        }
    }

    /// Make every live connection fail its next read
    pub fn drop_connections(&self) {
        let mut live = self.shared.live.lock().unwrap();
        for tx in live.drain(..) {
            let _ = tx.send(Script::Drop);
        }
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Stop answering pings
    pub fn set_silent_pings(&self, silent: bool) {
        self.shared.silent_pings.store(silent, Ordering::SeqCst);
    }

    /// Stop acknowledging subscribe/unsubscribe requests
    pub fn set_silent_acks(&self, silent: bool) {
        self.shared.silent_acks.store(silent, Ordering::SeqCst);
    }

    /// Chunks containing this symbol are refused
    pub fn reject_symbol(&self, symbol: &str) {
        self.shared.rejected.lock().unwrap().insert(symbol.to_string());
    }

    pub fn clear_rejections(&self) {
        self.shared.rejected.lock().unwrap().clear();
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> Vec<Vec<String>> {
        self.shared.subscribes.lock().unwrap().clone()
    }

    pub fn unsubscribes(&self) -> Vec<Vec<String>> {
        self.shared.unsubscribes.lock().unwrap().clone()
    }

    /// Every symbol ever subscribed, flattened
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscribes().into_iter().flatten().collect()
    }
}

pub struct ScriptedConnection {
    shared: Arc<Shared>,
    replies: VecDeque<FeedEvent>,
    rx: mpsc::UnboundedReceiver<Script>,
}

#[async_trait]
impl FeedConnector for ScriptedConnector {
    type Connection = ScriptedConnection;

    async fn connect(&self) -> Result<ScriptedConnection, FeedError> {
        let failing = self.shared.fail_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared.fail_connects.store(failing - 1, Ordering::SeqCst);
            return Err(FeedError::ConnectionFailed("scripted refusal".into()));
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.live.lock().unwrap().push(tx);
        Ok(ScriptedConnection {
            shared: Arc::clone(&self.shared),
            replies: VecDeque::new(),
            rx,
        })
    }
}

fn ack(op: &str, req_id: &str, success: bool) -> FeedEvent {
    FeedEvent::Ack(SubscribeAck {
        req_id: Some(req_id.to_string()),
        op: op.to_string(),
        success,
        ret_msg: if success { String::new() } else { "rejected".to_string() },
    })
}

#[async_trait]
impl FeedConnection for ScriptedConnection {
    async fn subscribe(&mut self, req_id: &str, symbols: &[String]) -> Result<(), FeedError> {
        self.shared.subscribes.lock().unwrap().push(symbols.to_vec());
        let refused = {
            let rejected = self.shared.rejected.lock().unwrap();
            symbols.iter().any(|s| rejected.contains(s))
        };
        if !self.shared.silent_acks.load(Ordering::SeqCst) {
            self.replies.push_back(ack("subscribe", req_id, !refused));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, req_id: &str, symbols: &[String]) -> Result<(), FeedError> {
        self.shared.unsubscribes.lock().unwrap().push(symbols.to_vec());
        if !self.shared.silent_acks.load(Ordering::SeqCst) {
            self.replies.push_back(ack("unsubscribe", req_id, true));
        }
        Ok(())
    }

    async fn ping(&mut self, _req_id: &str) -> Result<(), FeedError> {
        self.shared.pings.fetch_add(1, Ordering::SeqCst);
        if !self.shared.silent_pings.load(Ordering::SeqCst) {
            self.replies.push_back(FeedEvent::Pong);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<FeedEvent, FeedError> {
        if let Some(event) = self.replies.pop_front() {
            return Ok(event);
        }
        match self.rx.recv().await {
            Some(Script::Event(event)) => Ok(event),
            Some(Script::Drop) | None => Err(FeedError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), FeedError> {
        Ok(())
    }
}

/// Directory returning a settable symbol set, or failing when empty-handed
#[derive(Clone, Default)]
pub struct StaticDirectory {
    symbols: Arc<Mutex<Option<BTreeSet<String>>>>,
}

impl StaticDirectory {
    pub fn new(symbols: &[&str]) -> Self {
        let dir = Self::default();
        dir.set(symbols);
        dir
    }

    pub fn set(&self, symbols: &[&str]) {
        *self.symbols.lock().unwrap() = Some(symbols.iter().map(|s| s.to_string()).collect());
    }

    pub fn fail(&self) {
        *self.symbols.lock().unwrap() = None;
    }
}

#[async_trait]
impl SymbolDirectory for StaticDirectory {
    async fn discover(&self) -> Result<BTreeSet<String>, DiscoveryError> {
        self.symbols
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DiscoveryError::Exhausted {
                attempts: 1,
                last: "scripted failure".into(),
            })
    }
}

pub fn quote(symbol: &str, ts_ms: i64) -> QuoteRecord {
    let parsed = OptionSymbol::parse(symbol).unwrap();
    let ts = chrono::Utc.timestamp_millis_opt(ts_ms).unwrap();
    let mut record = QuoteRecord::for_symbol(&parsed, symbol, ts);
    record.mark_price = ts_ms as f64;
    record
}

pub fn symbols(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Poll `check` on paused time until it holds or `limit` elapses
pub async fn wait_for<F: FnMut() -> bool>(limit: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
