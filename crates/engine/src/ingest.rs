//! Ingest worker
//!
//! Single consumer of the queue every slot writes into. Runs on its own
//! thread so storage, aggregation and dispatch never stall socket reads.
//! When every sender is gone it flushes open bars, drains the dispatcher and
//! signals completion.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tickfeed_wire::{InstrumentToken, OhlcBar, Tick};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::aggregator::{Aggregation, AggregationEngine};
use crate::clock::{epoch_millis, now_tsc, tsc_elapsed};
use crate::dispatcher::{Dispatcher, MarketEvent};
use crate::metrics::FeedMetrics;
use crate::router::SharedRouter;
use crate::stats::{Counters, ThroughputWindow};
use crate::store::RingBufferStore;

/// Messages on the shared ingest queue
#[derive(Debug)]
pub enum Ingest {
    Tick(Tick),
    /// Instruments were unsubscribed; close their open bars
    Release(Vec<InstrumentToken>),
    /// Close bars left open past the stale timeout
    FlushStale,
}

pub struct IngestWorker {
    rx: mpsc::Receiver<Ingest>,
    router: SharedRouter,
    store: Arc<RingBufferStore>,
    aggregator: Arc<AggregationEngine>,
    dispatcher: Dispatcher,
    counters: Arc<Counters>,
    window: Arc<ThroughputWindow>,
    metrics: FeedMetrics,
    stale_timeout: Option<Duration>,
    shutdown_grace: Duration,
}

impl IngestWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<Ingest>,
        router: SharedRouter,
        store: Arc<RingBufferStore>,
        aggregator: Arc<AggregationEngine>,
        dispatcher: Dispatcher,
        counters: Arc<Counters>,
        window: Arc<ThroughputWindow>,
        metrics: FeedMetrics,
    ) -> Self {
        Self {
            rx,
            router,
            store,
            aggregator,
            dispatcher,
            counters,
            window,
            metrics,
            stale_timeout: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn with_stale_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Start on a dedicated thread; `done` fires after the final drain
    pub fn spawn(self, done: oneshot::Sender<()>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("tickfeed-ingest".to_string())
            .spawn(move || {
                self.run();
                let _ = done.send(());
            })
    }

    /// Process until the queue closes, then flush. Call from a dedicated
    /// std::thread (uses blocking receive).
    pub fn run(mut self) {
        info!("Ingest worker started");
        while let Some(msg) = self.rx.blocking_recv() {
            self.handle(msg);
        }
        self.finish();
    }

    fn handle(&self, msg: Ingest) {
        match msg {
            Ingest::Tick(tick) => {
                self.counters
                    .ingest_queue_depth
                    .fetch_sub(1, Ordering::Relaxed);
                self.process_tick(tick);
            }
            Ingest::Release(tokens) => {
                for token in tokens {
                    if let Some(bar) = self.aggregator.flush(token) {
                        self.emit_bar(bar);
                    }
                }
            }
            Ingest::FlushStale => {
                if let Some(timeout) = self.stale_timeout {
                    let bars = self.aggregator.flush_stale(epoch_millis(), timeout);
                    if !bars.is_empty() {
                        debug!(count = bars.len(), "Flushed stale bars");
                    }
                    for bar in bars {
                        self.emit_bar(bar);
                    }
                }
            }
        }
    }

    fn process_tick(&self, tick: Tick) {
        // Ticks still in flight after an unsubscribe are discarded
        if !self.router.read().is_subscribed(tick.token) {
            Counters::incr(&self.counters.filtered_ticks);
            return;
        }

        let start = now_tsc();
        match self.aggregator.feed(&tick) {
            Aggregation::Rolled(bar) => self.emit_bar(bar),
            Aggregation::Late => Counters::incr(&self.counters.late_ticks),
            Aggregation::Opened | Aggregation::Updated => {}
        }
        let arrival_ms = tick.arrival_ms;
        self.store.append(tick.clone());
        self.dispatcher.submit(MarketEvent::Tick(tick));

        let elapsed = tsc_elapsed(start, now_tsc());
        Counters::incr(&self.counters.ticks_processed);
        self.window.record(arrival_ms, 1);
        self.counters.record_processing(elapsed);
        self.metrics.observe_process_seconds(elapsed.as_secs_f64());
    }

    fn emit_bar(&self, bar: OhlcBar) {
        Counters::incr(&self.counters.bars_emitted);
        self.metrics.inc_bars(1);
        self.dispatcher.submit(MarketEvent::Bar(bar));
    }

    fn finish(self) {
        let bars = self.aggregator.flush_all();
        let flushed = bars.len();
        for bar in bars {
            self.emit_bar(bar);
        }
        let drained = self.dispatcher.shutdown(self.shutdown_grace);
        info!(
            flushed_bars = flushed,
            dispatcher_drained = drained,
            total_ticks = Counters::get(&self.counters.ticks_processed),
            "Ingest worker stopped"
        );
    }
}
