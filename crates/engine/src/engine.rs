//! Feed engine
//!
//! Wires the data flow: connection slots -> ingest queue -> ingest worker
//! (store, aggregate) -> dispatcher -> consumers. Owns the control and query
//! surface handed to the application.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tickfeed_wire::{InstrumentToken, Mode, OhlcBar, Tick};
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregator::AggregationEngine;
use crate::config::FeedConfig;
use crate::dispatcher::{Consumer, ConsumerHandle, ConsumerRegistry, Dispatcher};
use crate::error::FeedError;
use crate::event::FeedEvent;
use crate::ingest::{Ingest, IngestWorker};
use crate::metrics::{encode_metrics, FeedMetrics};
use crate::pool::ConnectionPool;
use crate::router::SharedRouter;
use crate::stats::{Counters, StatisticsCollector, StatsSnapshot, ThroughputWindow};
use crate::store::RingBufferStore;
use crate::transport::FeedTransport;
use crate::websocket::KiteTransport;

/// Background pieces that exist only between `start` and `stop`
struct Running {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    ingest_done: oneshot::Receiver<()>,
}

pub struct FeedEngine {
    config: Arc<FeedConfig>,
    pool: ConnectionPool,
    store: Arc<RingBufferStore>,
    aggregator: Arc<AggregationEngine>,
    registry: Arc<ConsumerRegistry>,
    counters: Arc<Counters>,
    window: Arc<ThroughputWindow>,
    metrics: FeedMetrics,
    stats: Arc<StatisticsCollector>,
    ingest_tx: Mutex<Option<mpsc::Sender<Ingest>>>,
    ingest_rx: Mutex<Option<mpsc::Receiver<Ingest>>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl FeedEngine {
    pub fn new(
        config: FeedConfig,
        transport: Arc<dyn FeedTransport>,
        access_token: impl Into<String>,
    ) -> Result<Self, FeedError> {
        config.validate()?;
        let config = Arc::new(config);

        let counters = Counters::new();
        let metrics = FeedMetrics::new(config.feed_name.clone());
        let store = Arc::new(RingBufferStore::new(
            config.tick_history_capacity,
            config.bar_history_capacity,
        ));
        let aggregator = Arc::new(AggregationEngine::new(
            config.bar_interval(),
            Arc::clone(&store),
        ));
        let window = Arc::new(ThroughputWindow::new(config.stats_window()));

        let (ingest_tx, ingest_rx) = mpsc::channel(config.ingest_queue_capacity);
        let pool = ConnectionPool::new(
            Arc::clone(&config),
            transport,
            ingest_tx.clone(),
            Arc::clone(&counters),
            &metrics,
            access_token,
        );
        let stats = Arc::new(StatisticsCollector::new(
            Arc::clone(&counters),
            Arc::clone(&window),
            pool.statuses(),
            Arc::clone(&store),
            pool.router(),
        ));

        Ok(Self {
            config,
            pool,
            store,
            aggregator,
            registry: Arc::new(ConsumerRegistry::new()),
            counters,
            window,
            metrics,
            stats,
            ingest_tx: Mutex::new(Some(ingest_tx)),
            ingest_rx: Mutex::new(Some(ingest_rx)),
            running: tokio::sync::Mutex::new(None),
        })
    }

    /// Engine connected to the production ticker
    pub fn kite(config: FeedConfig, access_token: impl Into<String>) -> Result<Self, FeedError> {
        let transport = Arc::new(KiteTransport::new(
            config.ws_url.clone(),
            config.api_key.clone(),
            config.read_timeout(),
        ));
        Self::new(config, transport, access_token)
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Start workers and connect every slot. The returned receiver carries
    /// slot-level conditions for the caller to act on. An engine runs once:
    /// starting again after `stop` fails with `AlreadyStarted`.
    pub async fn start(&self) -> Result<mpsc::UnboundedReceiver<FeedEvent>, FeedError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(FeedError::AlreadyStarted);
        }
        let ingest_rx = self
            .ingest_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(FeedError::AlreadyStarted)?;
        let ingest_tx = self.ingest_sender().ok_or(FeedError::NotRunning)?;

        let dispatcher = Dispatcher::spawn(
            self.config.dispatch_queue_capacity,
            self.config.backpressure,
            Arc::clone(&self.registry),
            Arc::clone(&self.counters),
            self.metrics.clone(),
        )?;
        let (done_tx, ingest_done) = oneshot::channel();
        let _ingest_thread = IngestWorker::new(
            ingest_rx,
            self.pool.router(),
            Arc::clone(&self.store),
            Arc::clone(&self.aggregator),
            dispatcher,
            Arc::clone(&self.counters),
            Arc::clone(&self.window),
            self.metrics.clone(),
        )
        .with_stale_timeout(self.config.bar_stale_timeout())
        .with_shutdown_grace(self.config.shutdown_grace())
        .spawn(done_tx)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.pool.open(events_tx).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        if self.config.bar_stale_timeout().is_some() {
            tasks.push(tokio::spawn(stale_flush_loop(
                ingest_tx,
                self.config.bar_interval(),
                stop_rx.clone(),
            )));
        }
        if let Some(period) = self.config.stats_log_interval() {
            tasks.push(tokio::spawn(stats_log_loop(
                Arc::clone(&self.stats),
                period,
                stop_rx,
            )));
        }

        *running = Some(Running {
            stop_tx,
            tasks,
            ingest_done,
        });
        info!(
            feed = %self.config.feed_name,
            slots = self.config.max_connections,
            capacity = self.config.capacity(),
            "Feed started"
        );
        Ok(events_rx)
    }

    /// Close every socket, drain the ingest queue, flush open bars and let
    /// the dispatcher deliver what is queued. Bounded by the configured
    /// shutdown grace at each stage.
    pub async fn stop(&self) -> Result<(), FeedError> {
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            return Err(FeedError::NotRunning);
        };
        let grace = self.config.shutdown_grace();
        info!(feed = %self.config.feed_name, "Stopping feed");

        running.stop_tx.send_replace(true);
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }

        self.pool.shutdown(grace).await;
        // Last sender: the ingest worker sees the queue close once slots exit
        self.ingest_tx.lock().unwrap_or_else(|e| e.into_inner()).take();

        // The worker itself waits up to `grace` for the dispatcher
        match tokio::time::timeout(grace.saturating_mul(2), running.ingest_done).await {
            Ok(_) => {
                let snapshot = self.stats.sample();
                info!(
                    total_ticks = snapshot.total_ticks,
                    bars = snapshot.bars_emitted,
                    dropped = snapshot.dropped_count,
                    callback_errors = snapshot.callback_error_count,
                    "Feed stopped"
                );
            }
            Err(_) => error!(
                grace_ms = grace.as_millis() as u64,
                "Ingest worker did not finish within grace period"
            ),
        }
        Ok(())
    }

    fn ingest_sender(&self) -> Option<mpsc::Sender<Ingest>> {
        self.ingest_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Subscribe instruments in `mode`. Already-subscribed tokens only change
    /// mode. Fails with `CapacityExceeded`, subscribing nothing, when the new
    /// tokens do not fit.
    pub fn subscribe(&self, tokens: &[InstrumentToken], mode: Mode) -> Result<usize, FeedError> {
        self.pool.subscribe(tokens, mode)
    }

    /// Unsubscribe instruments and close their open bars. Returns how many of
    /// them were subscribed.
    pub async fn unsubscribe(&self, tokens: &[InstrumentToken]) -> usize {
        let removed = self.pool.unsubscribe(tokens);
        if removed == 0 || self.running.lock().await.is_none() {
            return removed;
        }
        if let Some(tx) = self.ingest_sender() {
            if tx.send(Ingest::Release(tokens.to_vec())).await.is_err() {
                debug!("Ingest queue closed, open bars flushed at shutdown");
            }
        }
        removed
    }

    pub fn register(&self, consumer: Arc<dyn Consumer>) -> ConsumerHandle {
        self.registry.register(consumer)
    }

    pub fn unregister(&self, handle: ConsumerHandle) -> bool {
        self.registry.unregister(handle)
    }

    /// Up to `count` most recent ticks, oldest first
    pub fn latest_ticks(&self, token: InstrumentToken, count: usize) -> Vec<Tick> {
        self.store.latest(token, count)
    }

    /// Up to `count` most recent closed bars, oldest first
    pub fn latest_bars(&self, token: InstrumentToken, count: usize) -> Vec<OhlcBar> {
        self.store.latest_bars(token, count)
    }

    /// The still-open bar of an instrument
    pub fn current_bar(&self, token: InstrumentToken) -> Option<OhlcBar> {
        self.aggregator.current_bar(token)
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.sample()
    }

    /// Tokens the router has mapped to `slot`
    pub fn slots_for_replay(&self, slot: usize) -> BTreeSet<InstrumentToken> {
        self.pool.router().read().slots_for_replay(slot)
    }

    pub fn router(&self) -> SharedRouter {
        self.pool.router()
    }

    /// Hand over a fresh session token after `FeedEvent::AuthExpired`
    pub fn set_access_token(&self, token: impl Into<String>) {
        self.pool.set_access_token(token);
    }

    /// Restart a degraded slot; its tokens that could not be moved are
    /// subscribed again once it connects
    pub async fn reset_slot(&self, index: usize) -> Result<(), FeedError> {
        self.pool.reset_slot(index).await
    }

    /// Prometheus text exposition of all feed metrics
    pub fn metrics_text(&self) -> Result<String, prometheus::Error> {
        encode_metrics()
    }
}

/// Nudges the ingest worker to close bars left open past the stale timeout
async fn stale_flush_loop(
    ingest_tx: mpsc::Sender<Ingest>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                // A full queue just delays the flush to the next period
                if ingest_tx.try_send(Ingest::FlushStale).is_err() {
                    debug!("Ingest queue busy, skipping stale flush");
                }
            }
        }
    }
}

async fn stats_log_loop(
    stats: Arc<StatisticsCollector>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    // First tick completes immediately
    ticker.tick().await;
    loop {
        select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let s = stats.sample();
                info!(
                    ticks_per_second = s.ticks_per_second,
                    active_connections = s.active_connections,
                    total_connections = s.total_connections,
                    subscribed = s.subscribed_instruments,
                    buffer_usage = s.buffer_usage_fraction,
                    dropped = s.dropped_count,
                    callback_errors = s.callback_error_count,
                    malformed = s.malformed_frames,
                    queue_depth = s.ingest_queue_depth,
                    avg_processing_us = s.avg_processing_micros,
                    max_processing_us = s.max_processing_micros,
                    "Feed statistics"
                );
            }
        }
    }
}
