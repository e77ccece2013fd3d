//! Tick to OHLC bar aggregation
//!
//! Bars close when a tick for a later bucket arrives (watermark advance per
//! instrument). Without new ticks a bar stays open unless the caller runs
//! `flush_stale`, which the ingest worker only does when a stale timeout is
//! configured.
//!
//! A flush (stale, shutdown or unsubscribe) closes its bucket for good. After
//! an unsubscribe and resubscribe within the same bucket, the new ticks for
//! that bucket are `Late`: stored and dispatched but in no bar, so no two
//! bars ever cover the same bucket.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tickfeed_wire::{InstrumentToken, OhlcBar, Tick};
use tracing::trace;

use crate::store::RingBufferStore;

/// What `feed` did with a tick
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// First tick for the instrument, or first after a flush
    Opened,
    Updated,
    /// The previous bar closed and was stored; a new one is open
    Rolled(OhlcBar),
    /// Tick belongs to a bucket before the open or last closed one; not aggregated
    Late,
}

pub struct AggregationEngine {
    interval_ms: i64,
    open: DashMap<InstrumentToken, OhlcBar>,
    /// End of the last flushed bucket per instrument; earlier ticks are late
    closed_through: DashMap<InstrumentToken, i64>,
    store: Arc<RingBufferStore>,
}

impl AggregationEngine {
    pub fn new(interval: Duration, store: Arc<RingBufferStore>) -> Self {
        Self {
            interval_ms: (interval.as_millis() as i64).max(1),
            open: DashMap::new(),
            closed_through: DashMap::new(),
            store,
        }
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    pub fn feed(&self, tick: &Tick) -> Aggregation {
        let bucket = OhlcBar::bucket_start(tick.arrival_ms, self.interval_ms);

        let mut current = match self.open.get_mut(&tick.token) {
            Some(bar) => bar,
            None => {
                if self
                    .closed_through
                    .get(&tick.token)
                    .is_some_and(|end| bucket < *end)
                {
                    return Aggregation::Late;
                }
                self.open
                    .insert(tick.token, OhlcBar::open_with(tick, self.interval_ms));
                return Aggregation::Opened;
            }
        };

        if bucket == current.bucket_start_ms {
            current.update(tick);
            Aggregation::Updated
        } else if bucket > current.bucket_start_ms {
            let next = OhlcBar::open_with(tick, self.interval_ms);
            let closed = std::mem::replace(&mut *current, next);
            drop(current);
            trace!(
                token = closed.token,
                start = closed.bucket_start_ms,
                ticks = closed.tick_count,
                "Bar closed"
            );
            self.store.push_bar(closed);
            Aggregation::Rolled(closed)
        } else {
            Aggregation::Late
        }
    }

    /// Close the instrument's open bar, if any
    pub fn flush(&self, token: InstrumentToken) -> Option<OhlcBar> {
        let (_, bar) = self.open.remove(&token)?;
        self.close(bar);
        Some(bar)
    }

    fn close(&self, bar: OhlcBar) {
        self.closed_through.insert(bar.token, bar.bucket_end_ms());
        self.store.push_bar(bar);
    }

    /// Close every open bar, ordered by token then bucket
    pub fn flush_all(&self) -> Vec<OhlcBar> {
        let mut tokens: Vec<InstrumentToken> = self.open.iter().map(|e| *e.key()).collect();
        tokens.sort_unstable();
        tokens.into_iter().filter_map(|t| self.flush(t)).collect()
    }

    /// Close bars whose bucket ended more than `timeout` before `now_ms`
    pub fn flush_stale(&self, now_ms: i64, timeout: Duration) -> Vec<OhlcBar> {
        let cutoff = now_ms - timeout.as_millis() as i64;
        let mut stale: Vec<InstrumentToken> = self
            .open
            .iter()
            .filter(|e| e.value().bucket_end_ms() <= cutoff)
            .map(|e| *e.key())
            .collect();
        stale.sort_unstable();
        stale
            .into_iter()
            // re-check under the entry lock; a tick may have rolled it meanwhile
            .filter_map(|t| {
                self.open
                    .remove_if(&t, |_, bar| bar.bucket_end_ms() <= cutoff)
                    .map(|(_, bar)| bar)
            })
            .inspect(|bar| self.close(*bar))
            .collect()
    }

    /// Copy of the still-open bar
    pub fn current_bar(&self, token: InstrumentToken) -> Option<OhlcBar> {
        self.open.get(&token).map(|bar| *bar)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(interval_ms: u64) -> (AggregationEngine, Arc<RingBufferStore>) {
        let store = Arc::new(RingBufferStore::new(16, 16));
        (
            AggregationEngine::new(Duration::from_millis(interval_ms), Arc::clone(&store)),
            store,
        )
    }

    #[test]
    fn test_prices_in_one_bucket() {
        let (agg, _store) = engine(1_000);
        let prices = [100.0, 105.0, 98.0, 102.0];
        for (i, price) in prices.iter().enumerate() {
            agg.feed(&Tick::ltp(1, 5_000 + i as i64 * 10, i as u64, *price));
        }
        let bar = agg.current_bar(1).unwrap();
        assert_eq!(
            (bar.open, bar.high, bar.low, bar.close, bar.tick_count),
            (100.0, 105.0, 98.0, 102.0, 4)
        );
        assert_eq!(bar.bucket_start_ms, 5_000);
    }

    #[test]
    fn test_roll_stores_closed_bar() {
        let (agg, store) = engine(1_000);
        assert_eq!(agg.feed(&Tick::ltp(1, 100, 0, 10.0)), Aggregation::Opened);
        assert_eq!(agg.feed(&Tick::ltp(1, 900, 1, 11.0)), Aggregation::Updated);

        match agg.feed(&Tick::ltp(1, 2_500, 2, 12.0)) {
            Aggregation::Rolled(bar) => {
                assert_eq!(bar.bucket_start_ms, 0);
                assert_eq!(bar.close, 11.0);
                assert_eq!(bar.tick_count, 2);
            }
            other => panic!("expected roll, got {:?}", other),
        }
        assert_eq!(store.latest_bars(1, 10).len(), 1);
        // skipped bucket 1000 produces no empty bar
        assert_eq!(agg.current_bar(1).unwrap().bucket_start_ms, 2_000);
    }

    #[test]
    fn test_late_tick_is_not_aggregated() {
        let (agg, _store) = engine(1_000);
        agg.feed(&Tick::ltp(1, 3_100, 0, 50.0));
        assert_eq!(agg.feed(&Tick::ltp(1, 2_999, 1, 1.0)), Aggregation::Late);
        let bar = agg.current_bar(1).unwrap();
        assert_eq!(bar.low, 50.0);
        assert_eq!(bar.tick_count, 1);
    }

    #[test]
    fn test_instruments_are_independent() {
        let (agg, _store) = engine(1_000);
        agg.feed(&Tick::ltp(1, 0, 0, 1.0));
        agg.feed(&Tick::ltp(2, 5_000, 1, 2.0));
        assert_eq!(agg.feed(&Tick::ltp(1, 10, 2, 3.0)), Aggregation::Updated);
        assert_eq!(agg.open_count(), 2);
    }

    #[test]
    fn test_flush_and_flush_all() {
        let (agg, store) = engine(1_000);
        agg.feed(&Tick::ltp(2, 0, 0, 1.0));
        agg.feed(&Tick::ltp(1, 0, 1, 1.0));

        assert!(agg.flush(3).is_none());
        let flushed = agg.flush(2).unwrap();
        assert_eq!(flushed.token, 2);
        assert!(agg.current_bar(2).is_none());

        let rest = agg.flush_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].token, 1);
        assert_eq!(agg.open_count(), 0);
        assert_eq!(store.latest_bars(2, 1).len(), 1);

        // the flushed bucket stays closed; the next one opens normally
        assert_eq!(agg.feed(&Tick::ltp(1, 20, 2, 4.0)), Aggregation::Late);
        assert_eq!(agg.feed(&Tick::ltp(1, 1_000, 3, 4.0)), Aggregation::Opened);
    }

    #[test]
    fn test_flush_stale_respects_timeout() {
        let (agg, _store) = engine(1_000);
        agg.feed(&Tick::ltp(1, 0, 0, 1.0)); // bucket ends at 1000
        agg.feed(&Tick::ltp(2, 4_000, 1, 1.0)); // bucket ends at 5000

        assert!(agg.flush_stale(1_400, Duration::from_millis(500)).is_empty());
        let stale = agg.flush_stale(1_500, Duration::from_millis(500));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].token, 1);
        assert!(agg.current_bar(2).is_some());
    }

    #[test]
    fn test_every_tick_lands_in_exactly_one_bar() {
        let store = Arc::new(RingBufferStore::new(16, 4096));
        let agg = AggregationEngine::new(Duration::from_millis(250), Arc::clone(&store));
        let mut ts = 0i64;
        let mut stamps = Vec::new();
        for seq in 0..500u64 {
            ts += (seq % 7) as i64 * 13;
            stamps.push(ts);
            assert_ne!(agg.feed(&Tick::ltp(4, ts, seq, seq as f64)), Aggregation::Late);
        }
        agg.flush_all();

        let bars = store.latest_bars(4, 4096);
        for pair in bars.windows(2) {
            assert!(pair[0].bucket_end_ms() <= pair[1].bucket_start_ms, "overlap");
        }
        assert_eq!(bars.iter().map(|b| b.tick_count).sum::<u32>(), 500);
        for ts in stamps {
            assert_eq!(bars.iter().filter(|b| b.contains(ts)).count(), 1);
        }
    }
}
