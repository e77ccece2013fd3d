//! Connection slot
//!
//! One managed connection: connect, replay the router's token set, read frames
//! into the shared ingest queue, and reconnect with backoff when the socket
//! drops. State machine:
//!
//! `Disconnected -> Connecting -> Subscribed -> (drop) Disconnected -> ...`
//! and `Degraded` once reconnect attempts run out (terminal until reset).

use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tickfeed_wire::{InstrumentToken, Mode, ServerMessage, Tick, WireCodec};
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::clock::epoch_millis;
use crate::config::FeedConfig;
use crate::error::SlotError;
use crate::ingest::Ingest;
use crate::metrics::SlotMetrics;
use crate::router::SharedRouter;
use crate::stats::{Counters, SlotSnapshot};
use crate::transport::{FeedStream, FeedTransport, InboundFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SlotState {
    Disconnected = 0,
    Connecting = 1,
    Subscribed = 2,
    Degraded = 3,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SlotState::Connecting,
            2 => SlotState::Subscribed,
            3 => SlotState::Degraded,
            _ => SlotState::Disconnected,
        }
    }
}

/// Health of one slot, shared with the statistics collector
#[derive(Debug)]
pub struct SlotStatus {
    index: usize,
    state: AtomicU8,
    tokens: AtomicUsize,
    reconnect_attempts: AtomicU32,
    frames: AtomicU64,
    last_activity_ms: AtomicI64,
}

impl SlotStatus {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: AtomicU8::new(SlotState::Disconnected as u8),
            tokens: AtomicUsize::new(0),
            reconnect_attempts: AtomicU32::new(0),
            frames: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_tokens(&self, count: usize) {
        self.tokens.store(count, Ordering::Relaxed);
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::Relaxed);
    }

    /// Count a frame and return its arrival stamp. The stamp never goes
    /// below the previous one, so a wall clock stepping back cannot reorder
    /// this connection's ticks.
    fn record_frame(&self, now_ms: i64) -> i64 {
        self.frames.fetch_add(1, Ordering::Relaxed);
        let prev = self.last_activity_ms.fetch_max(now_ms, Ordering::Relaxed);
        prev.max(now_ms)
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            index: self.index,
            state: self.state(),
            tokens: self.tokens.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts(),
            frames_received: self.frames.load(Ordering::Relaxed),
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }
}

/// Incremental subscription changes for a live slot. The router has already
/// been updated when one of these is sent.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotCommand {
    Subscribe {
        mode: Mode,
        tokens: Vec<InstrumentToken>,
    },
    Unsubscribe {
        tokens: Vec<InstrumentToken>,
    },
}

/// Reported by slots to the pool supervisor
#[derive(Debug, Clone)]
pub enum SlotSignal {
    AuthExpired { slot: usize, reason: String },
    Degraded { slot: usize, attempts: u32, error: String },
    Recovered { slot: usize },
}

/// Exponential reconnect delay with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay randomly added or removed
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_delay_ms),
            max: Duration::from_millis(config.reconnect_max_delay_ms),
            jitter: config.reconnect_jitter,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based): base * 2^(attempt-1),
    /// jittered, never above `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self.base.saturating_mul(1u32 << exp).min(self.max);
        if self.jitter <= 0.0 {
            return raw;
        }
        let factor = 1.0 - self.jitter + 2.0 * self.jitter * rand::random::<f64>();
        raw.mul_f64(factor).min(self.max)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

/// Everything a slot needs besides its own command channel
#[derive(Clone)]
pub struct SlotContext {
    pub config: Arc<FeedConfig>,
    pub transport: Arc<dyn FeedTransport>,
    pub router: SharedRouter,
    pub codec: WireCodec,
    pub ingest_tx: mpsc::Sender<Ingest>,
    pub counters: Arc<Counters>,
    pub signals: mpsc::UnboundedSender<SlotSignal>,
    pub access_token: watch::Receiver<String>,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    Degraded,
}

/// Returned when a slot task ends; the command receiver goes back to the pool
/// so a reset slot keeps the same channel.
#[derive(Debug)]
pub struct SlotExit {
    pub index: usize,
    pub reason: ExitReason,
    pub cmd_rx: mpsc::UnboundedReceiver<SlotCommand>,
}

enum SessionEnd {
    Shutdown,
    Failed(SlotError),
}

pub struct ConnectionSlot {
    index: usize,
    ctx: SlotContext,
    cmd_rx: mpsc::UnboundedReceiver<SlotCommand>,
    status: Arc<SlotStatus>,
    metrics: SlotMetrics,
    backoff: Backoff,
    /// Consecutive failures since the last successful subscription
    attempts: u32,
}

impl ConnectionSlot {
    pub fn new(
        index: usize,
        ctx: SlotContext,
        cmd_rx: mpsc::UnboundedReceiver<SlotCommand>,
        status: Arc<SlotStatus>,
        metrics: SlotMetrics,
    ) -> Self {
        let backoff = Backoff::from_config(&ctx.config);
        Self {
            index,
            ctx,
            cmd_rx,
            status,
            metrics,
            backoff,
            attempts: 0,
        }
    }

    fn set_state(&self, state: SlotState) {
        self.status.set_state(state);
        self.metrics.set_state(state as i64);
    }

    /// True once shutdown was requested or the pool dropped its sender
    fn shutting_down(&self) -> bool {
        *self.ctx.shutdown.borrow() || self.ctx.shutdown.has_changed().is_err()
    }

    /// Run until shutdown or degradation
    pub async fn run(mut self) -> SlotExit {
        let reason = self.supervise().await;
        match reason {
            ExitReason::Shutdown => {
                self.set_state(SlotState::Disconnected);
                info!(slot = self.index, "Slot stopped");
            }
            ExitReason::Degraded => self.set_state(SlotState::Degraded),
        }
        SlotExit {
            index: self.index,
            reason,
            cmd_rx: self.cmd_rx,
        }
    }

    async fn supervise(&mut self) -> ExitReason {
        loop {
            if self.shutting_down() {
                return ExitReason::Shutdown;
            }

            self.set_state(SlotState::Connecting);
            let token = self.ctx.access_token.borrow_and_update().clone();
            let transport = Arc::clone(&self.ctx.transport);
            let connected = select! {
                _ = self.ctx.shutdown.changed() => continue,
                result = transport.connect(self.index, &token) => result,
            };

            let end = match connected {
                Ok(stream) => self.session(stream).await,
                Err(e) => SessionEnd::Failed(e),
            };

            let err = match end {
                SessionEnd::Shutdown => return ExitReason::Shutdown,
                SessionEnd::Failed(e) => e,
            };
            self.set_state(SlotState::Disconnected);

            if let SlotError::AuthExpired(reason) = err {
                warn!(
                    slot = self.index,
                    reason = %reason,
                    "Session rejected, waiting for a new access token"
                );
                let _ = self.ctx.signals.send(SlotSignal::AuthExpired {
                    slot: self.index,
                    reason,
                });
                select! {
                    _ = self.ctx.shutdown.changed() => {}
                    changed = self.ctx.access_token.changed() => {
                        if changed.is_err() {
                            return ExitReason::Shutdown;
                        }
                        info!(slot = self.index, "Received new access token");
                        self.attempts = 0;
                        self.status.set_reconnect_attempts(0);
                    }
                }
                continue;
            }

            self.attempts += 1;
            self.status.set_reconnect_attempts(self.attempts);
            if self.backoff.exhausted(self.attempts) {
                error!(
                    slot = self.index,
                    attempts = self.attempts,
                    error = %err,
                    "Reconnect attempts exhausted, slot degraded"
                );
                // Visible before the supervisor handles the signal
                self.set_state(SlotState::Degraded);
                let _ = self.ctx.signals.send(SlotSignal::Degraded {
                    slot: self.index,
                    attempts: self.attempts,
                    error: err.to_string(),
                });
                return ExitReason::Degraded;
            }

            let delay = self.backoff.delay(self.attempts);
            warn!(
                slot = self.index,
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Connection lost, reconnecting"
            );
            self.metrics.inc_reconnect();
            select! {
                _ = self.ctx.shutdown.changed() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(&mut self, mut stream: Box<dyn FeedStream>) -> SessionEnd {
        // Anything queued so far is already reflected in the router; draining
        // before reading the replay plan can only duplicate work, never lose it.
        while self.cmd_rx.try_recv().is_ok() {}
        let plan = self.ctx.router.read().replay_plan(self.index);

        let mut live: HashSet<InstrumentToken> = HashSet::new();
        for (mode, tokens) in plan {
            if let Err(e) = self.send_subscribe(&mut stream, &mut live, mode, &tokens).await {
                stream.close().await;
                return SessionEnd::Failed(e);
            }
        }

        let recovered = self.attempts > 0;
        self.attempts = 0;
        self.status.set_reconnect_attempts(0);
        self.set_state(SlotState::Subscribed);
        self.sync_token_count(&live);
        info!(slot = self.index, tokens = live.len(), "Slot subscribed");
        if recovered {
            let _ = self.ctx.signals.send(SlotSignal::Recovered { slot: self.index });
        }

        loop {
            select! {
                _ = self.ctx.shutdown.changed() => {
                    stream.close().await;
                    return SessionEnd::Shutdown;
                }
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        stream.close().await;
                        return SessionEnd::Shutdown;
                    };
                    if let Err(e) = self.apply(&mut stream, &mut live, cmd).await {
                        stream.close().await;
                        return SessionEnd::Failed(e);
                    }
                }
                frame = stream.recv() => {
                    match frame {
                        Ok(frame) => self.handle_frame(frame).await,
                        Err(e) => {
                            stream.close().await;
                            return SessionEnd::Failed(e);
                        }
                    }
                }
            }
        }
    }

    fn sync_token_count(&self, live: &HashSet<InstrumentToken>) {
        self.status.set_tokens(live.len());
        self.metrics.set_instruments(live.len());
    }

    async fn send_subscribe(
        &self,
        stream: &mut Box<dyn FeedStream>,
        live: &mut HashSet<InstrumentToken>,
        mode: Mode,
        tokens: &[InstrumentToken],
    ) -> Result<(), SlotError> {
        let batch = self.ctx.config.subscribe_batch_size.max(1);
        let fresh: Vec<InstrumentToken> = tokens
            .iter()
            .copied()
            .filter(|t| !live.contains(t))
            .collect();

        for chunk in fresh.chunks(batch) {
            let frame = WireCodec::encode_subscribe(chunk)
                .map_err(|e| SlotError::Transient(e.to_string()))?;
            stream.send_text(frame).await?;
        }
        // Mode frames also cover tokens already live whose mode changed
        for chunk in tokens.chunks(batch) {
            let frame = WireCodec::encode_mode(mode, chunk)
                .map_err(|e| SlotError::Transient(e.to_string()))?;
            stream.send_text(frame).await?;
        }
        live.extend(fresh);
        debug!(slot = self.index, mode = %mode, count = tokens.len(), "Sent subscription");
        Ok(())
    }

    async fn apply(
        &self,
        stream: &mut Box<dyn FeedStream>,
        live: &mut HashSet<InstrumentToken>,
        cmd: SlotCommand,
    ) -> Result<(), SlotError> {
        match cmd {
            SlotCommand::Subscribe { mode, tokens } => {
                self.send_subscribe(stream, live, mode, &tokens).await?;
            }
            SlotCommand::Unsubscribe { tokens } => {
                let gone: Vec<InstrumentToken> =
                    tokens.into_iter().filter(|t| live.remove(t)).collect();
                let batch = self.ctx.config.subscribe_batch_size.max(1);
                for chunk in gone.chunks(batch) {
                    let frame = WireCodec::encode_unsubscribe(chunk)
                        .map_err(|e| SlotError::Transient(e.to_string()))?;
                    stream.send_text(frame).await?;
                }
                debug!(slot = self.index, count = gone.len(), "Sent unsubscribe");
            }
        }
        self.sync_token_count(live);
        Ok(())
    }

    async fn handle_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Binary(data) => {
                let arrival_ms = self.status.record_frame(epoch_millis());
                match self.ctx.codec.decode_binary(&data, arrival_ms) {
                    Ok(decoded) => {
                        if decoded.malformed > 0 {
                            let n = decoded.malformed as u64;
                            Counters::add(&self.ctx.counters.malformed_frames, n);
                            self.metrics.inc_malformed(n);
                            debug!(slot = self.index, malformed = n, "Skipped malformed packets");
                        }
                        if decoded.heartbeat {
                            trace!(slot = self.index, "Heartbeat");
                            return;
                        }
                        self.metrics.inc_ticks(decoded.ticks.len() as u64);
                        // One wait budget per message, not per tick
                        let deadline = Instant::now() + self.ctx.config.ingest_enqueue_timeout();
                        for tick in decoded.ticks {
                            self.enqueue(tick, deadline).await;
                        }
                    }
                    Err(e) => {
                        Counters::incr(&self.ctx.counters.malformed_frames);
                        self.metrics.inc_malformed(1);
                        debug!(slot = self.index, error = %e, "Undecodable binary frame");
                    }
                }
            }
            InboundFrame::Text(text) => {
                self.status.record_frame(epoch_millis());
                match WireCodec::decode_text(&text) {
                    Ok(ServerMessage::Error { data }) => {
                        Counters::incr(&self.ctx.counters.server_errors);
                        warn!(slot = self.index, error = %data, "Server error message");
                    }
                    Ok(ServerMessage::Order { .. }) | Ok(ServerMessage::Message { .. }) => {
                        trace!(slot = self.index, "Ignoring text message");
                    }
                    Ok(ServerMessage::Unknown) | Err(_) => {
                        Counters::incr(&self.ctx.counters.malformed_frames);
                        self.metrics.inc_malformed(1);
                        debug!(slot = self.index, len = text.len(), "Unrecognised text frame");
                    }
                }
            }
        }
    }

    /// Queue a tick, waiting for room no later than `deadline`. Once the
    /// deadline has passed the remaining ticks of the message drop at once.
    async fn enqueue(&self, tick: Tick, deadline: Instant) {
        let sent = match self.ctx.ingest_tx.try_send(Ingest::Tick(tick)) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(msg)) => matches!(
                timeout_at(deadline, self.ctx.ingest_tx.send(msg)).await,
                Ok(Ok(()))
            ),
        };
        if sent {
            self.ctx
                .counters
                .ingest_queue_depth
                .fetch_add(1, Ordering::Relaxed);
        } else {
            Counters::incr(&self.ctx.counters.ingest_dropped);
            self.metrics.inc_ingest_dropped();
            debug!(slot = self.index, "Ingest queue full, dropped tick");
        }
    }
}
