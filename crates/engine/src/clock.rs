//! Time sources: wall clock for tick timestamps, TSC for latency deltas

use once_cell::sync::Lazy;
use quanta::Clock;
use std::time::Duration;

/// Process-wide TSC clock used for processing-latency deltas
pub static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// Raw TSC reading, no syscall
#[inline]
pub fn now_tsc() -> u64 {
    CLOCK.raw()
}

/// Elapsed time between two raw TSC readings
#[inline]
pub fn tsc_elapsed(start: u64, end: u64) -> Duration {
    CLOCK.delta(start, end)
}

/// Wall-clock epoch milliseconds, stamped once per inbound frame
#[inline]
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_tsc_returns_increasing_values() {
        let t1 = now_tsc();
        let t2 = now_tsc();
        assert!(t2 >= t1, "TSC should be monotonic");
        assert!(tsc_elapsed(t1, t2) < Duration::from_secs(1));
    }

    #[test]
    fn test_epoch_millis_is_recent() {
        // 2023-11-14 or later
        assert!(epoch_millis() > 1_700_000_000_000);
    }
}
