//! Feed statistics
//!
//! Components bump shared atomic counters; `sample` only reads them, so taking
//! a snapshot never touches ingestion state.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::epoch_millis;
use crate::router::SharedRouter;
use crate::slot::{SlotState, SlotStatus};
use crate::store::RingBufferStore;

/// Counters written by slots, the ingest worker and the dispatcher
#[derive(Debug, Default)]
pub struct Counters {
    pub ticks_processed: AtomicU64,
    pub ingest_dropped: AtomicU64,
    pub dispatch_dropped: AtomicU64,
    pub callback_errors: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub server_errors: AtomicU64,
    pub late_ticks: AtomicU64,
    /// Ticks for instruments no longer subscribed, discarded at ingest
    pub filtered_ticks: AtomicU64,
    pub bars_emitted: AtomicU64,
    pub processing_nanos_total: AtomicU64,
    pub processing_nanos_max: AtomicU64,
    pub ingest_queue_depth: AtomicI64,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_processing(&self, elapsed: Duration) {
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.processing_nanos_total.fetch_add(nanos, Ordering::Relaxed);
        self.processing_nanos_max.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Per-second tick counts over a trailing window.
///
/// Written by the single ingest worker; any thread may read.
#[derive(Debug)]
pub struct ThroughputWindow {
    seconds: Vec<AtomicI64>,
    counts: Vec<AtomicU64>,
    window_secs: i64,
}

impl ThroughputWindow {
    pub fn new(window: Duration) -> Self {
        let window_secs = window.as_secs().max(1) as i64;
        // one extra bucket for the second in progress
        let len = window_secs as usize + 1;
        Self {
            seconds: (0..len).map(|_| AtomicI64::new(i64::MIN)).collect(),
            counts: (0..len).map(|_| AtomicU64::new(0)).collect(),
            window_secs,
        }
    }

    fn index(&self, second: i64) -> usize {
        second.rem_euclid(self.seconds.len() as i64) as usize
    }

    pub fn record(&self, now_ms: i64, n: u64) {
        let second = now_ms.div_euclid(1000);
        let idx = self.index(second);
        if self.seconds[idx].load(Ordering::Acquire) != second {
            self.counts[idx].store(0, Ordering::Relaxed);
            self.seconds[idx].store(second, Ordering::Release);
        }
        self.counts[idx].fetch_add(n, Ordering::Relaxed);
    }

    /// Average over the last `window` completed seconds
    pub fn rate(&self, now_ms: i64) -> f64 {
        let current = now_ms.div_euclid(1000);
        let oldest = current - self.window_secs;
        let total: u64 = self
            .seconds
            .iter()
            .zip(&self.counts)
            .filter(|(sec, _)| {
                let s = sec.load(Ordering::Acquire);
                s >= oldest && s < current
            })
            .map(|(_, count)| count.load(Ordering::Relaxed))
            .sum();
        total as f64 / self.window_secs as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub index: usize,
    pub state: SlotState,
    pub tokens: usize,
    pub reconnect_attempts: u32,
    pub frames_received: u64,
    pub last_activity_ms: i64,
}

/// Point-in-time feed statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub ticks_per_second: f64,
    pub active_connections: usize,
    pub total_connections: usize,
    pub buffer_usage_fraction: f64,
    /// Ingest plus dispatch drops
    pub dropped_count: u64,
    pub ingest_dropped: u64,
    pub dispatch_dropped: u64,
    pub callback_error_count: u64,
    pub malformed_frames: u64,
    pub server_errors: u64,
    pub late_ticks: u64,
    pub total_ticks: u64,
    pub bars_emitted: u64,
    pub ingest_queue_depth: u64,
    pub subscribed_instruments: usize,
    pub avg_processing_micros: f64,
    pub max_processing_micros: f64,
    pub slots: Vec<SlotSnapshot>,
}

pub struct StatisticsCollector {
    counters: Arc<Counters>,
    window: Arc<ThroughputWindow>,
    slots: Vec<Arc<SlotStatus>>,
    store: Arc<RingBufferStore>,
    router: SharedRouter,
}

impl StatisticsCollector {
    pub fn new(
        counters: Arc<Counters>,
        window: Arc<ThroughputWindow>,
        slots: Vec<Arc<SlotStatus>>,
        store: Arc<RingBufferStore>,
        router: SharedRouter,
    ) -> Self {
        Self {
            counters,
            window,
            slots,
            store,
            router,
        }
    }

    pub fn sample(&self) -> StatsSnapshot {
        self.sample_at(epoch_millis())
    }

    pub fn sample_at(&self, now_ms: i64) -> StatsSnapshot {
        let c = &self.counters;
        let slots: Vec<SlotSnapshot> = self
            .slots
            .iter()
            .map(|status| status.snapshot())
            .collect();
        let active = slots
            .iter()
            .filter(|s| s.state == SlotState::Subscribed)
            .count();

        let total_ticks = Counters::get(&c.ticks_processed);
        let ingest_dropped = Counters::get(&c.ingest_dropped);
        let dispatch_dropped = Counters::get(&c.dispatch_dropped);
        let avg_processing_micros = if total_ticks == 0 {
            0.0
        } else {
            Counters::get(&c.processing_nanos_total) as f64 / total_ticks as f64 / 1_000.0
        };

        StatsSnapshot {
            ticks_per_second: self.window.rate(now_ms),
            active_connections: active,
            total_connections: slots.len(),
            buffer_usage_fraction: self.store.usage_fraction(),
            dropped_count: ingest_dropped + dispatch_dropped,
            ingest_dropped,
            dispatch_dropped,
            callback_error_count: Counters::get(&c.callback_errors),
            malformed_frames: Counters::get(&c.malformed_frames),
            server_errors: Counters::get(&c.server_errors),
            late_ticks: Counters::get(&c.late_ticks),
            total_ticks,
            bars_emitted: Counters::get(&c.bars_emitted),
            ingest_queue_depth: c.ingest_queue_depth.load(Ordering::Relaxed).max(0) as u64,
            subscribed_instruments: self.router.read().len(),
            avg_processing_micros,
            max_processing_micros: Counters::get(&c.processing_nanos_max) as f64 / 1_000.0,
            slots,
        }
    }
}
