//! Connection pool
//!
//! Owns a fixed set of connection slots. Subscriptions are placed by the
//! router and forwarded to the owning slot as commands; a supervisor task
//! turns slot signals into evacuations and upward `FeedEvent`s.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tickfeed_wire::{InstrumentToken, Mode, WireCodec};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::event::FeedEvent;
use crate::ingest::Ingest;
use crate::metrics::{FeedMetrics, SlotMetrics};
use crate::router::{SharedRouter, SubscriptionRouter};
use crate::slot::{
    ConnectionSlot, SlotCommand, SlotContext, SlotExit, SlotSignal, SlotState,
    SlotStatus,
};
use crate::stats::Counters;
use crate::transport::FeedTransport;

pub struct ConnectionPool {
    router: SharedRouter,
    statuses: Vec<Arc<SlotStatus>>,
    slot_metrics: Vec<SlotMetrics>,
    cmd_txs: Arc<Vec<mpsc::UnboundedSender<SlotCommand>>>,
    /// Command receivers of slots that are not running
    idle_cmd_rxs: Mutex<Vec<Option<mpsc::UnboundedReceiver<SlotCommand>>>>,
    handles: tokio::sync::Mutex<Vec<Option<JoinHandle<SlotExit>>>>,
    /// Template cloned into each slot; dropped at shutdown so the ingest
    /// queue can close
    ctx: Mutex<Option<SlotContext>>,
    signals_rx: Mutex<Option<mpsc::UnboundedReceiver<SlotSignal>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    token_tx: watch::Sender<String>,
}

impl ConnectionPool {
    pub fn new(
        config: Arc<FeedConfig>,
        transport: Arc<dyn FeedTransport>,
        ingest_tx: mpsc::Sender<Ingest>,
        counters: Arc<Counters>,
        metrics: &FeedMetrics,
        access_token: impl Into<String>,
    ) -> Self {
        let slots = config.max_connections;
        let router = SharedRouter::new(SubscriptionRouter::new(
            slots,
            config.max_instruments_per_connection,
            config.placement,
        ));

        let (cmd_txs, cmd_rxs): (Vec<_>, Vec<_>) =
            (0..slots).map(|_| mpsc::unbounded_channel()).unzip();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (token_tx, token_rx) = watch::channel(access_token.into());

        let ctx = SlotContext {
            config,
            transport,
            router: router.clone(),
            codec: WireCodec::new(),
            ingest_tx,
            counters,
            signals: signals_tx,
            access_token: token_rx,
            shutdown: shutdown_rx,
        };

        Self {
            router,
            statuses: (0..slots).map(|i| Arc::new(SlotStatus::new(i))).collect(),
            slot_metrics: (0..slots).map(|i| metrics.for_slot(i)).collect(),
            cmd_txs: Arc::new(cmd_txs),
            idle_cmd_rxs: Mutex::new(cmd_rxs.into_iter().map(Some).collect()),
            handles: tokio::sync::Mutex::new((0..slots).map(|_| None).collect()),
            ctx: Mutex::new(Some(ctx)),
            signals_rx: Mutex::new(Some(signals_rx)),
            supervisor: Mutex::new(None),
            shutdown_tx,
            token_tx,
        }
    }

    pub fn router(&self) -> SharedRouter {
        self.router.clone()
    }

    pub fn statuses(&self) -> Vec<Arc<SlotStatus>> {
        self.statuses.clone()
    }

    pub fn slot_count(&self) -> usize {
        self.statuses.len()
    }

    fn context(&self) -> Result<SlotContext, FeedError> {
        self.ctx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(FeedError::NotRunning)
    }

    fn spawn_slot(
        &self,
        index: usize,
        ctx: SlotContext,
        cmd_rx: mpsc::UnboundedReceiver<SlotCommand>,
    ) -> JoinHandle<SlotExit> {
        let slot = ConnectionSlot::new(
            index,
            ctx,
            cmd_rx,
            Arc::clone(&self.statuses[index]),
            self.slot_metrics[index].clone(),
        );
        tokio::spawn(slot.run())
    }

    /// Start every slot's connection loop and the supervisor
    pub async fn open(&self, events: mpsc::UnboundedSender<FeedEvent>) -> Result<(), FeedError> {
        let signals_rx = self
            .signals_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(FeedError::AlreadyStarted)?;
        let ctx = self.context()?;

        let mut handles = self.handles.lock().await;
        let mut idle = self.idle_cmd_rxs.lock().unwrap_or_else(|e| e.into_inner());
        for (index, slot_handle) in handles.iter_mut().enumerate() {
            if let Some(cmd_rx) = idle[index].take() {
                *slot_handle = Some(self.spawn_slot(index, ctx.clone(), cmd_rx));
            }
        }
        drop(idle);

        let supervisor = Supervisor {
            router: self.router.clone(),
            statuses: self.statuses.clone(),
            cmd_txs: Arc::clone(&self.cmd_txs),
            events,
        };
        *self.supervisor.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(tokio::spawn(supervisor.run(signals_rx)));

        info!(
            slots = self.slot_count(),
            instruments = self.router.read().len(),
            "Connection pool opened"
        );
        Ok(())
    }

    fn send_command(&self, slot: usize, cmd: SlotCommand) {
        if let Some(tx) = self.cmd_txs.get(slot) {
            // A closed channel means the pool is shutting down; the router
            // still holds the truth for any later replay
            if tx.send(cmd).is_err() {
                debug!(slot, "Slot command channel closed");
            }
        }
    }

    /// Place instruments on slots and subscribe them. All-or-nothing: fails
    /// with `CapacityExceeded` without changing anything if the new tokens do
    /// not fit.
    pub fn subscribe(&self, tokens: &[InstrumentToken], mode: Mode) -> Result<usize, FeedError> {
        let plan = self.router.write().assign_all(tokens, mode)?;
        let mut placed = 0;
        for ((slot, mode), tokens) in plan {
            placed += tokens.len();
            self.send_command(slot, SlotCommand::Subscribe { mode, tokens });
        }
        debug!(placed, mode = %mode, "Subscribed instruments");
        Ok(placed)
    }

    /// Remove instruments; returns how many were subscribed
    pub fn unsubscribe(&self, tokens: &[InstrumentToken]) -> usize {
        let released = self.router.write().release_all(tokens);
        let mut count = 0;
        for (slot, tokens) in released {
            count += tokens.len();
            self.send_command(slot, SlotCommand::Unsubscribe { tokens });
        }
        debug!(count, "Unsubscribed instruments");
        count
    }

    /// Hand a fresh session token to every slot; slots parked after a
    /// rejected session reconnect with it
    pub fn set_access_token(&self, token: impl Into<String>) {
        self.token_tx.send_replace(token.into());
        info!("Access token updated");
    }

    /// Restart a degraded slot
    pub async fn reset_slot(&self, index: usize) -> Result<(), FeedError> {
        let status = self
            .statuses
            .get(index)
            .ok_or(FeedError::UnknownSlot(index))?;
        if status.state() != SlotState::Degraded {
            return Err(FeedError::SlotNotDegraded(index));
        }
        let ctx = self.context()?;

        let mut handles = self.handles.lock().await;
        let exit = match handles[index].take() {
            Some(handle) => handle.await.ok(),
            None => None,
        };
        let cmd_rx = match exit {
            Some(SlotExit { cmd_rx, .. }) => cmd_rx,
            None => {
                let idle = self.idle_cmd_rxs.lock().unwrap_or_else(|e| e.into_inner())[index].take();
                idle.ok_or(FeedError::NotRunning)?
            }
        };

        self.router.write().restore(index);
        status.set_state(SlotState::Disconnected);
        handles[index] = Some(self.spawn_slot(index, ctx, cmd_rx));
        info!(slot = index, "Slot reset");
        Ok(())
    }

    /// Stop all slots, waiting up to `grace` before aborting stragglers
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown_tx.send_replace(true);
        // Drop the template so only running slots keep the ingest queue open
        self.ctx.lock().unwrap_or_else(|e| e.into_inner()).take();

        let deadline = tokio::time::Instant::now() + grace;
        let mut handles = self.handles.lock().await;
        for (index, slot_handle) in handles.iter_mut().enumerate() {
            let Some(mut handle) = slot_handle.take() else {
                continue;
            };
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(exit)) => debug!(slot = exit.index, reason = ?exit.reason, "Slot exited"),
                Ok(Err(e)) => warn!(slot = index, error = %e, "Slot task failed"),
                Err(_) => {
                    warn!(slot = index, "Slot did not stop within grace period, aborting");
                    handle.abort();
                }
            }
        }
        drop(handles);

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut supervisor) = supervisor {
            if tokio::time::timeout_at(deadline, &mut supervisor).await.is_err() {
                supervisor.abort();
            }
        }
        info!("Connection pool closed");
    }
}

/// Reacts to slot signals: evacuates degraded slots and reports upward
struct Supervisor {
    router: SharedRouter,
    statuses: Vec<Arc<SlotStatus>>,
    cmd_txs: Arc<Vec<mpsc::UnboundedSender<SlotCommand>>>,
    events: mpsc::UnboundedSender<FeedEvent>,
}

impl Supervisor {
    async fn run(self, mut signals: mpsc::UnboundedReceiver<SlotSignal>) {
        while let Some(signal) = signals.recv().await {
            match signal {
                SlotSignal::Degraded {
                    slot,
                    attempts,
                    error: reason,
                } => self.on_degraded(slot, attempts, &reason),
                SlotSignal::AuthExpired { slot, reason } => {
                    self.emit(FeedEvent::AuthExpired { slot, reason });
                }
                SlotSignal::Recovered { slot } => {
                    info!(slot, "Slot recovered");
                    self.emit(FeedEvent::SlotRecovered { slot });
                }
            }
        }
        debug!("Pool supervisor stopped");
    }

    fn emit(&self, event: FeedEvent) {
        if self.events.send(event).is_err() {
            debug!("Feed event receiver dropped");
        }
    }

    fn on_degraded(&self, slot: usize, attempts: u32, reason: &str) {
        let evacuation = self.router.write().evacuate(slot);
        let moved = evacuation.moved_count();
        for ((target, mode), tokens) in evacuation.moved {
            if let Some(tx) = self.cmd_txs.get(target) {
                let _ = tx.send(SlotCommand::Subscribe { mode, tokens });
            }
        }
        if !evacuation.stranded.is_empty() {
            warn!(
                slot,
                stranded = evacuation.stranded.len(),
                "No spare capacity, instruments remain on degraded slot until reset"
            );
        }
        error!(slot, attempts, moved, error = %reason, "Slot degraded");
        self.emit(FeedEvent::SlotDegraded {
            slot,
            attempts,
            moved,
            stranded: evacuation.stranded.len(),
        });

        let degraded = self
            .statuses
            .iter()
            .filter(|s| s.state() == SlotState::Degraded)
            .count();
        if degraded == self.statuses.len() {
            error!(slots = degraded, "All connection slots degraded, feed lost");
            self.emit(FeedEvent::FeedLost { slots: degraded });
        }
    }
}
