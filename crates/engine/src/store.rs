//! Per-instrument tick and bar history
//!
//! Each instrument gets its own fixed-capacity ring behind its own lock, so
//! the ingest worker (single writer) only contends with readers of the same
//! instrument, and a reader always copies out a consistent snapshot.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tickfeed_wire::{InstrumentToken, OhlcBar, Tick};

/// Fixed-capacity circular buffer with a monotonically increasing cursor
#[derive(Debug)]
pub struct Ring<T> {
    entries: Vec<T>,
    capacity: usize,
    write_pos: u64,
}

impl<T: Clone> Ring<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            write_pos: 0,
        }
    }

    /// Append, overwriting the oldest entry when full. Returns true if the
    /// ring grew (nothing was overwritten).
    pub fn push(&mut self, value: T) -> bool {
        let idx = (self.write_pos % self.capacity as u64) as usize;
        self.write_pos += 1;
        if self.entries.len() < self.capacity {
            self.entries.push(value);
            true
        } else {
            self.entries[idx] = value;
            false
        }
    }

    /// Up to `count` most recent entries, oldest first
    pub fn latest(&self, count: usize) -> Vec<T> {
        let len = self.entries.len();
        let take = count.min(len);
        let mut out = Vec::with_capacity(take);
        // index of the oldest entry still held
        let start = if len < self.capacity {
            0
        } else {
            (self.write_pos % self.capacity as u64) as usize
        };
        for i in (len - take)..len {
            out.push(self.entries[(start + i) % len].clone());
        }
        out
    }

    pub fn last(&self) -> Option<&T> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = ((self.write_pos - 1) % self.capacity as u64) as usize;
        self.entries.get(idx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries ever written
    pub fn write_position(&self) -> u64 {
        self.write_pos
    }
}

type Shared<T> = Arc<RwLock<Ring<T>>>;

/// Tick and bar history for every instrument seen by the ingest worker.
///
/// Buffers are allocated lazily on the first append; queries for an
/// instrument that never received data return an empty vector. `latest`
/// results are oldest to newest.
#[derive(Debug)]
pub struct RingBufferStore {
    ticks: DashMap<InstrumentToken, Shared<Tick>>,
    bars: DashMap<InstrumentToken, Shared<OhlcBar>>,
    tick_capacity: usize,
    bar_capacity: usize,
    stored_ticks: AtomicUsize,
}

impl RingBufferStore {
    pub fn new(tick_capacity: usize, bar_capacity: usize) -> Self {
        Self {
            ticks: DashMap::new(),
            bars: DashMap::new(),
            tick_capacity: tick_capacity.max(1),
            bar_capacity: bar_capacity.max(1),
            stored_ticks: AtomicUsize::new(0),
        }
    }

    fn ring<T: Clone>(
        map: &DashMap<InstrumentToken, Shared<T>>,
        token: InstrumentToken,
        capacity: usize,
    ) -> Shared<T> {
        // Clone the Arc out so the map shard is not held while the ring is locked
        map.entry(token)
            .or_insert_with(|| Arc::new(RwLock::new(Ring::with_capacity(capacity))))
            .clone()
    }

    fn snapshot<T: Clone>(
        map: &DashMap<InstrumentToken, Shared<T>>,
        token: InstrumentToken,
        count: usize,
    ) -> Vec<T> {
        let Some(ring) = map.get(&token).map(|r| Arc::clone(r.value())) else {
            return Vec::new();
        };
        let guard = ring.read().unwrap_or_else(|e| e.into_inner());
        guard.latest(count)
    }

    pub fn append(&self, tick: Tick) {
        let ring = Self::ring(&self.ticks, tick.token, self.tick_capacity);
        let grew = ring.write().unwrap_or_else(|e| e.into_inner()).push(tick);
        if grew {
            self.stored_ticks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn latest(&self, token: InstrumentToken, count: usize) -> Vec<Tick> {
        Self::snapshot(&self.ticks, token, count)
    }

    pub fn last_tick(&self, token: InstrumentToken) -> Option<Tick> {
        let ring = self.ticks.get(&token).map(|r| Arc::clone(r.value()))?;
        let guard = ring.read().unwrap_or_else(|e| e.into_inner());
        guard.last().cloned()
    }

    pub fn push_bar(&self, bar: OhlcBar) {
        let ring = Self::ring(&self.bars, bar.token, self.bar_capacity);
        ring.write().unwrap_or_else(|e| e.into_inner()).push(bar);
    }

    pub fn latest_bars(&self, token: InstrumentToken, count: usize) -> Vec<OhlcBar> {
        Self::snapshot(&self.bars, token, count)
    }

    pub fn instrument_count(&self) -> usize {
        self.ticks.len()
    }

    /// Ticks held across all instruments
    pub fn stored_ticks(&self) -> usize {
        self.stored_ticks.load(Ordering::Relaxed)
    }

    /// Occupied fraction of the allocated tick buffers, 0.0 when none exist
    pub fn usage_fraction(&self) -> f64 {
        let allocated = self.instrument_count() * self.tick_capacity;
        if allocated == 0 {
            return 0.0;
        }
        self.stored_ticks() as f64 / allocated as f64
    }
}
