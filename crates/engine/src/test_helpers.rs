//! Test helpers for driving the feed without a network.
//!
//! Provides a `MockTransport` implementing `FeedTransport` with scripted
//! per-slot connect behaviour, plus packet builders and a polling helper for
//! asserting on asynchronous state.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tickfeed_wire::{InstrumentToken, WireCodec};
use tokio::sync::mpsc;

use crate::config::FeedConfig;
use crate::error::SlotError;
use crate::transport::{FeedStream, FeedTransport, InboundFrame};

/// Configurable response for `connect`.
#[derive(Clone, Debug)]
pub enum ConnectBehavior {
    /// Open a scripted stream.
    Accept,
    /// Return Err(Transient).
    Fail(String),
    /// Return Err(AuthExpired).
    AuthReject(String),
}

enum Inbound {
    Frame(InboundFrame),
    Drop(String),
}

/// One accepted connection and everything the slot sent on it
struct MockConnection {
    slot: usize,
    access_token: String,
    sent: Arc<Mutex<Vec<String>>>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<usize, VecDeque<ConnectBehavior>>,
    default_behavior: Option<ConnectBehavior>,
    /// (slot, access token) of every connect attempt
    attempts: Vec<(usize, String)>,
    connections: Vec<MockConnection>,
}

/// In-memory transport. Scripts are consumed one entry per connect attempt;
/// a slot without a script uses the default (accept unless changed).
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Behaviour for attempts not covered by a slot script
    pub fn set_default(&self, behavior: ConnectBehavior) {
        self.state().default_behavior = Some(behavior);
    }

    /// Queue behaviours for the next connect attempts of `slot`
    pub fn script(&self, slot: usize, behaviors: impl IntoIterator<Item = ConnectBehavior>) {
        self.state()
            .scripts
            .entry(slot)
            .or_default()
            .extend(behaviors);
    }

    /// Connect attempts made by `slot`, successful or not
    pub fn connect_count(&self, slot: usize) -> usize {
        self.state().attempts.iter().filter(|(s, _)| *s == slot).count()
    }

    /// Access tokens presented by `slot`, in attempt order
    pub fn tokens_presented(&self, slot: usize) -> Vec<String> {
        self.state()
            .attempts
            .iter()
            .filter(|(s, _)| *s == slot)
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// Accepted connections of `slot`
    pub fn connection_count(&self, slot: usize) -> usize {
        self.state()
            .connections
            .iter()
            .filter(|c| c.slot == slot)
            .count()
    }

    fn with_latest<T>(&self, slot: usize, f: impl FnOnce(&MockConnection) -> T) -> Option<T> {
        let state = self.state();
        state.connections.iter().rev().find(|c| c.slot == slot).map(f)
    }

    /// Deliver a frame on the latest connection of `slot`
    pub fn push_frame(&self, slot: usize, frame: InboundFrame) -> bool {
        self.with_latest(slot, |c| c.inbound.send(Inbound::Frame(frame)).is_ok())
            .unwrap_or(false)
    }

    pub fn push_binary(&self, slot: usize, data: Vec<u8>) -> bool {
        self.push_frame(slot, InboundFrame::Binary(data))
    }

    pub fn push_text(&self, slot: usize, text: impl Into<String>) -> bool {
        self.push_frame(slot, InboundFrame::Text(text.into()))
    }

    /// Make the latest connection of `slot` fail its next read
    pub fn drop_connection(&self, slot: usize, reason: &str) -> bool {
        self.with_latest(slot, |c| c.inbound.send(Inbound::Drop(reason.to_string())).is_ok())
            .unwrap_or(false)
    }

    /// Control frames sent on the latest connection of `slot`
    pub fn sent_frames(&self, slot: usize) -> Vec<String> {
        self.with_latest(slot, |c| c.sent.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }

    /// Access token the latest connection of `slot` was opened with
    pub fn latest_access_token(&self, slot: usize) -> Option<String> {
        self.with_latest(slot, |c| c.access_token.clone())
    }

    /// Every token in subscribe frames on the latest connection, in send
    /// order and including repeats
    pub fn subscribe_requests(&self, slot: usize) -> Vec<InstrumentToken> {
        self.sent_frames(slot)
            .iter()
            .filter_map(|f| parse_control(f))
            .filter(|(action, _)| action == "subscribe")
            .flat_map(|(_, tokens)| tokens)
            .collect()
    }

    /// Net subscribed set on the latest connection of `slot`
    pub fn subscribed_tokens(&self, slot: usize) -> BTreeSet<InstrumentToken> {
        let mut live = BTreeSet::new();
        for (action, tokens) in self.sent_frames(slot).iter().filter_map(|f| parse_control(f)) {
            match action.as_str() {
                "subscribe" => live.extend(tokens),
                "unsubscribe" => {
                    for t in tokens {
                        live.remove(&t);
                    }
                }
                _ => {}
            }
        }
        live
    }
}

/// Action and token list of a subscribe/unsubscribe control frame
fn parse_control(frame: &str) -> Option<(String, Vec<InstrumentToken>)> {
    let value: serde_json::Value = serde_json::from_str(frame).ok()?;
    let action = value.get("a")?.as_str()?.to_string();
    let tokens = value
        .get("v")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_u64())
        .map(|v| v as InstrumentToken)
        .collect();
    Some((action, tokens))
}

#[async_trait]
impl FeedTransport for MockTransport {
    async fn connect(
        &self,
        slot: usize,
        access_token: &str,
    ) -> Result<Box<dyn FeedStream>, SlotError> {
        let mut state = self.state();
        state.attempts.push((slot, access_token.to_string()));
        let scripted = state.scripts.get_mut(&slot).and_then(|q| q.pop_front());
        let behavior = scripted
            .or_else(|| state.default_behavior.clone())
            .unwrap_or(ConnectBehavior::Accept);

        match behavior {
            ConnectBehavior::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                let sent = Arc::new(Mutex::new(Vec::new()));
                state.connections.push(MockConnection {
                    slot,
                    access_token: access_token.to_string(),
                    sent: Arc::clone(&sent),
                    inbound: tx,
                });
                Ok(Box::new(MockStream {
                    inbound: rx,
                    sent,
                    closed: false,
                }))
            }
            ConnectBehavior::Fail(reason) => Err(SlotError::Transient(reason)),
            ConnectBehavior::AuthReject(reason) => Err(SlotError::AuthExpired(reason)),
        }
    }
}

struct MockStream {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: bool,
}

#[async_trait]
impl FeedStream for MockStream {
    async fn send_text(&mut self, text: String) -> Result<(), SlotError> {
        if self.closed {
            return Err(SlotError::Transient("stream closed".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Result<InboundFrame, SlotError> {
        match self.inbound.recv().await {
            Some(Inbound::Frame(frame)) => Ok(frame),
            Some(Inbound::Drop(reason)) => Err(SlotError::Transient(reason)),
            None => Err(SlotError::Transient("transport dropped".to_string())),
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Binary message carrying one LTP packet per `(token, price)`
pub fn ltp_message(ticks: &[(InstrumentToken, f64)]) -> Vec<u8> {
    let packets: Vec<Vec<u8>> = ticks
        .iter()
        .map(|&(token, price)| WireCodec::encode_ltp_packet(token, price))
        .collect();
    WireCodec::frame_packets(&packets)
}

/// Config with fast reconnects and no periodic logging, for tests
pub fn fast_config(slots: usize, per_slot: usize) -> FeedConfig {
    FeedConfig {
        feed_name: "test".to_string(),
        max_connections: slots,
        max_instruments_per_connection: per_slot,
        reconnect_base_delay_ms: 5,
        reconnect_max_delay_ms: 20,
        reconnect_jitter: 0.0,
        max_reconnect_attempts: 3,
        stats_log_interval_secs: 0,
        shutdown_grace_ms: 2_000,
        ..FeedConfig::default()
    }
}

/// Poll `cond` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
