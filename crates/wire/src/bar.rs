use serde::{Deserialize, Serialize};

use crate::tick::{InstrumentToken, Tick};

/// Open/high/low/close summary of the ticks in one time bucket.
///
/// Mutable while its bucket is open; the aggregator hands out copies only
/// after the bucket closes (or as an explicit snapshot of the open bar).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OhlcBar {
    pub token: InstrumentToken,
    /// Epoch milliseconds, aligned to `interval_ms`
    pub bucket_start_ms: i64,
    pub interval_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Sum of last-traded quantities of the ticks in the bucket
    pub volume: u64,
    pub tick_count: u32,
}

impl OhlcBar {
    /// Bucket start for a timestamp: `floor(ts / interval) * interval`
    pub fn bucket_start(timestamp_ms: i64, interval_ms: i64) -> i64 {
        timestamp_ms.div_euclid(interval_ms) * interval_ms
    }

    /// Open a bar from the first tick of its bucket
    pub fn open_with(tick: &Tick, interval_ms: i64) -> Self {
        let price = tick.last_price();
        Self {
            token: tick.token,
            bucket_start_ms: Self::bucket_start(tick.arrival_ms, interval_ms),
            interval_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: tick.traded_quantity(),
            tick_count: 1,
        }
    }

    pub fn update(&mut self, tick: &Tick) {
        let price = tick.last_price();
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += tick.traded_quantity();
        self.tick_count += 1;
    }

    /// Exclusive end of the bucket
    pub fn bucket_end_ms(&self) -> i64 {
        self.bucket_start_ms + self.interval_ms
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.bucket_start_ms && timestamp_ms < self.bucket_end_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_start_alignment() {
        assert_eq!(OhlcBar::bucket_start(1_999, 1_000), 1_000);
        assert_eq!(OhlcBar::bucket_start(2_000, 1_000), 2_000);
        assert_eq!(OhlcBar::bucket_start(0, 1_000), 0);
        assert_eq!(OhlcBar::bucket_start(-1, 1_000), -1_000);
    }

    #[test]
    fn test_open_and_update() {
        let mut bar = OhlcBar::open_with(&Tick::ltp(5, 1_250, 0, 100.0), 1_000);
        assert_eq!(bar.bucket_start_ms, 1_000);
        assert_eq!(bar.tick_count, 1);

        bar.update(&Tick::ltp(5, 1_300, 1, 105.0));
        bar.update(&Tick::ltp(5, 1_400, 2, 98.0));
        bar.update(&Tick::ltp(5, 1_999, 3, 102.0));

        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 105.0);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.close, 102.0);
        assert_eq!(bar.tick_count, 4);
        assert!(bar.contains(1_999));
        assert!(!bar.contains(2_000));
    }
}
