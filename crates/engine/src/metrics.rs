//! Prometheus metrics for the feed
//!
//! Process-wide collectors labelled by feed name and slot. Scrape them with
//! `encode_metrics()`.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

const LABEL_FEED: &str = "feed";
const LABEL_SLOT: &str = "slot";
const LABEL_STAGE: &str = "stage";

/// Ticks decoded per slot
static TICKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickfeed_ticks_total",
        "Total ticks decoded per slot",
        &[LABEL_FEED, LABEL_SLOT]
    )
    .expect("Failed to register ticks_total metric")
});

/// Skipped packets and unrecognised text frames per slot
static MALFORMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickfeed_malformed_frames_total",
        "Malformed packets or frames skipped per slot",
        &[LABEL_FEED, LABEL_SLOT]
    )
    .expect("Failed to register malformed_frames_total metric")
});

/// Slot lifecycle state (0 disconnected, 1 connecting, 2 subscribed, 3 degraded)
static SLOT_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tickfeed_slot_state",
        "Connection slot state (0=disconnected, 1=connecting, 2=subscribed, 3=degraded)",
        &[LABEL_FEED, LABEL_SLOT]
    )
    .expect("Failed to register slot_state metric")
});

static INSTRUMENTS_SUBSCRIBED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tickfeed_instruments_subscribed",
        "Instruments mapped to each slot",
        &[LABEL_FEED, LABEL_SLOT]
    )
    .expect("Failed to register instruments_subscribed metric")
});

static RECONNECTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickfeed_reconnects_total",
        "Reconnect attempts per slot",
        &[LABEL_FEED, LABEL_SLOT]
    )
    .expect("Failed to register reconnects_total metric")
});

/// Events dropped by backpressure, by stage (ingest or dispatch)
static DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickfeed_dropped_total",
        "Events dropped under backpressure",
        &[LABEL_FEED, LABEL_STAGE]
    )
    .expect("Failed to register dropped_total metric")
});

static CALLBACK_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickfeed_callback_errors_total",
        "Consumer callbacks that returned an error or panicked",
        &[LABEL_FEED]
    )
    .expect("Failed to register callback_errors_total metric")
});

static BARS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickfeed_bars_total",
        "OHLC bars closed",
        &[LABEL_FEED]
    )
    .expect("Failed to register bars_total metric")
});

/// Per-tick ingest processing time (store + aggregate + enqueue)
static PROCESS_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tickfeed_tick_process_seconds",
        "Time to store, aggregate and enqueue one tick",
        &[LABEL_FEED],
        vec![1e-6, 5e-6, 1e-5, 5e-5, 1e-4, 5e-4, 1e-3, 1e-2]
    )
    .expect("Failed to register tick_process_seconds metric")
});

/// Handle for recording feed-wide metrics
#[derive(Clone, Debug)]
pub struct FeedMetrics {
    feed: String,
}

impl FeedMetrics {
    pub fn new(feed: impl Into<String>) -> Self {
        Self { feed: feed.into() }
    }

    pub fn for_slot(&self, slot: usize) -> SlotMetrics {
        SlotMetrics {
            feed: self.feed.clone(),
            slot: slot.to_string(),
        }
    }

    pub fn inc_dispatch_dropped(&self) {
        DROPPED_TOTAL
            .with_label_values(&[&self.feed, "dispatch"])
            .inc();
    }

    pub fn inc_callback_error(&self) {
        CALLBACK_ERRORS_TOTAL.with_label_values(&[&self.feed]).inc();
    }

    pub fn inc_bars(&self, n: u64) {
        BARS_TOTAL.with_label_values(&[&self.feed]).inc_by(n);
    }

    pub fn observe_process_seconds(&self, secs: f64) {
        PROCESS_SECONDS.with_label_values(&[&self.feed]).observe(secs);
    }
}

/// Handle for recording metrics of one connection slot
#[derive(Clone, Debug)]
pub struct SlotMetrics {
    feed: String,
    slot: String,
}

impl SlotMetrics {
    pub fn inc_ticks(&self, n: u64) {
        TICKS_TOTAL
            .with_label_values(&[&self.feed, &self.slot])
            .inc_by(n);
    }

    pub fn inc_malformed(&self, n: u64) {
        MALFORMED_TOTAL
            .with_label_values(&[&self.feed, &self.slot])
            .inc_by(n);
    }

    pub fn inc_ingest_dropped(&self) {
        DROPPED_TOTAL
            .with_label_values(&[&self.feed, "ingest"])
            .inc();
    }

    pub fn inc_reconnect(&self) {
        RECONNECTS_TOTAL
            .with_label_values(&[&self.feed, &self.slot])
            .inc();
    }

    pub fn set_state(&self, state: i64) {
        SLOT_STATE
            .with_label_values(&[&self.feed, &self.slot])
            .set(state);
    }

    pub fn set_instruments(&self, count: usize) {
        INSTRUMENTS_SUBSCRIBED
            .with_label_values(&[&self.feed, &self.slot])
            .set(count as i64);
    }
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
