//! Consumer fan-out
//!
//! Ticks and bars are queued on a bounded crossbeam channel and delivered by a
//! dedicated worker thread, so a slow consumer never stalls ingestion. Every
//! callback runs isolated: errors and panics are counted and the remaining
//! consumers still get the event.

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tickfeed_wire::{OhlcBar, Tick};
use tracing::{debug, error, info, warn};

use crate::config::BackpressurePolicy;
use crate::error::ConsumerError;
use crate::metrics::FeedMetrics;
use crate::stats::Counters;

/// Receives feed events. Both methods default to doing nothing.
pub trait Consumer: Send + Sync {
    fn on_tick(&self, _tick: &Tick) -> Result<(), ConsumerError> {
        Ok(())
    }

    fn on_bar(&self, _bar: &OhlcBar) -> Result<(), ConsumerError> {
        Ok(())
    }
}

/// Adapts a closure into a tick-only consumer
pub struct TickFn<F>(pub F);

impl<F> TickFn<F>
where
    F: Fn(&Tick) -> Result<(), ConsumerError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Consumer for TickFn<F>
where
    F: Fn(&Tick) -> Result<(), ConsumerError> + Send + Sync,
{
    fn on_tick(&self, tick: &Tick) -> Result<(), ConsumerError> {
        (self.0)(tick)
    }
}

/// Adapts a closure into a bar-only consumer
pub struct BarFn<F>(pub F);

impl<F> BarFn<F>
where
    F: Fn(&OhlcBar) -> Result<(), ConsumerError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Consumer for BarFn<F>
where
    F: Fn(&OhlcBar) -> Result<(), ConsumerError> + Send + Sync,
{
    fn on_bar(&self, bar: &OhlcBar) -> Result<(), ConsumerError> {
        (self.0)(bar)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerHandle(u64);

#[derive(Debug, Clone)]
pub enum MarketEvent {
    Tick(Tick),
    Bar(OhlcBar),
}

type Entry = (ConsumerHandle, Arc<dyn Consumer>);

/// Registered consumers. Fan-out iterates a snapshot taken when delivery of an
/// event starts, so concurrent (un)registration never skips or repeats a
/// consumer for that event.
#[derive(Default)]
pub struct ConsumerRegistry {
    entries: RwLock<Arc<Vec<Entry>>>,
    next_id: AtomicU64,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, consumer: Arc<dyn Consumer>) -> ConsumerHandle {
        let handle = ConsumerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push((handle, consumer));
        *entries = Arc::new(next);
        debug!(handle = handle.0, consumers = entries.len(), "Registered consumer");
        handle
    }

    /// Returns false if the handle was not registered
    pub fn unregister(&self, handle: ConsumerHandle) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if !entries.iter().any(|(h, _)| *h == handle) {
            return false;
        }
        let next: Vec<Entry> = entries
            .iter()
            .filter(|(h, _)| *h != handle)
            .cloned()
            .collect();
        *entries = Arc::new(next);
        debug!(handle = handle.0, consumers = entries.len(), "Unregistered consumer");
        true
    }

    pub fn snapshot(&self) -> Arc<Vec<Entry>> {
        Arc::clone(&self.entries.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one event to every consumer. Returns the number of failed
    /// callbacks.
    pub fn fanout(&self, event: &MarketEvent) -> usize {
        let mut failed = 0;
        for (handle, consumer) in self.snapshot().iter() {
            let result = catch_unwind(AssertUnwindSafe(|| match event {
                MarketEvent::Tick(tick) => consumer.on_tick(tick),
                MarketEvent::Bar(bar) => consumer.on_bar(bar),
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    debug!(handle = handle.0, error = %e, "Consumer callback failed");
                }
                Err(_) => {
                    failed += 1;
                    warn!(handle = handle.0, "Consumer callback panicked");
                }
            }
        }
        failed
    }
}

/// Bounded dispatch queue plus its worker thread
pub struct Dispatcher {
    tx: Option<Sender<MarketEvent>>,
    /// Producer-side receiver used to evict the oldest event under DropOldest
    evict_rx: Option<Receiver<MarketEvent>>,
    done_rx: Receiver<()>,
    worker: Option<JoinHandle<()>>,
    policy: BackpressurePolicy,
    counters: Arc<Counters>,
    metrics: FeedMetrics,
}

impl Dispatcher {
    pub fn spawn(
        capacity: usize,
        policy: BackpressurePolicy,
        registry: Arc<ConsumerRegistry>,
        counters: Arc<Counters>,
        metrics: FeedMetrics,
    ) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded::<MarketEvent>(capacity.max(1));
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let evict_rx = rx.clone();

        let worker_counters = Arc::clone(&counters);
        let worker_metrics = metrics.clone();
        let worker = std::thread::Builder::new()
            .name("tickfeed-dispatch".to_string())
            .spawn(move || {
                // Ends once every sender is gone
                while let Ok(event) = rx.recv() {
                    let failed = registry.fanout(&event);
                    if failed > 0 {
                        Counters::add(&worker_counters.callback_errors, failed as u64);
                        for _ in 0..failed {
                            worker_metrics.inc_callback_error();
                        }
                    }
                }
                let _ = done_tx.send(());
            })?;

        info!(capacity, ?policy, "Dispatcher started");
        Ok(Self {
            tx: Some(tx),
            evict_rx: Some(evict_rx),
            done_rx,
            worker: Some(worker),
            policy,
            counters,
            metrics,
        })
    }

    fn count_drop(&self) {
        Counters::incr(&self.counters.dispatch_dropped);
        self.metrics.inc_dispatch_dropped();
    }

    /// Queue an event. Never blocks longer than the configured timeout.
    /// Returns false if an event (this one or an older one) was dropped.
    pub fn submit(&self, event: MarketEvent) -> bool {
        let (Some(tx), Some(evict_rx)) = (&self.tx, &self.evict_rx) else {
            self.count_drop();
            return false;
        };
        match self.policy {
            BackpressurePolicy::DropOldest => match tx.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(event)) => {
                    if evict_rx.try_recv().is_ok() {
                        self.count_drop();
                    }
                    if tx.try_send(event).is_err() {
                        self.count_drop();
                    }
                    false
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.count_drop();
                    false
                }
            },
            BackpressurePolicy::BlockWithTimeout { timeout_ms } => {
                match tx.send_timeout(event, Duration::from_millis(timeout_ms)) {
                    Ok(()) => true,
                    Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => {
                        self.count_drop();
                        false
                    }
                }
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.tx.as_ref().map(Sender::len).unwrap_or(0)
    }

    /// Close the queue and wait up to `grace` for the worker to deliver what
    /// is left. A worker stuck in a callback is detached.
    pub fn shutdown(mut self, grace: Duration) -> bool {
        let pending = self.queue_len();
        // Dropping the only sender lets the worker see the end of the queue
        self.tx.take();
        self.evict_rx.take();

        match self.done_rx.recv_timeout(grace) {
            Ok(()) => {
                if let Some(handle) = self.worker.take() {
                    let _ = handle.join();
                }
                info!(pending, "Dispatcher drained");
                true
            }
            Err(_) => {
                error!(
                    pending,
                    grace_ms = grace.as_millis() as u64,
                    "Dispatcher did not drain within grace period, detaching worker"
                );
                self.worker.take();
                false
            }
        }
    }
}
