//! Feed configuration
//!
//! Built once and shared by `Arc` with every component. Defaults match the
//! production ticker limits; `from_env` overrides individual fields from
//! `TICKFEED_*` environment variables.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Production ticker endpoint
pub const KITE_WS_URL: &str = "wss://ws.kite.trade";

/// How the router picks a slot for a new instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Fewest tokens among slots with room; ties go to the lowest index
    #[default]
    LeastLoaded,
    /// Lowest-index slot with room
    FirstFit,
}

impl FromStr for Placement {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "least_loaded" | "least-loaded" => Ok(Placement::LeastLoaded),
            "first_fit" | "first-fit" => Ok(Placement::FirstFit),
            other => Err(ConfigError::InvalidEnvVar {
                name: "TICKFEED_PLACEMENT".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// What the dispatch queue does when consumers fall behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Evict the oldest queued event to make room for the new one
    #[default]
    DropOldest,
    /// Wait up to `timeout_ms` for room, then drop the new event
    BlockWithTimeout { timeout_ms: u64 },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Label for metrics and logs
    pub feed_name: String,
    pub ws_url: String,
    pub api_key: String,

    pub max_connections: usize,
    pub max_instruments_per_connection: usize,
    pub placement: Placement,
    /// Tokens per subscribe/mode control frame
    pub subscribe_batch_size: usize,

    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Fraction of the delay added or removed at random, 0.0..=1.0
    pub reconnect_jitter: f64,
    pub max_reconnect_attempts: u32,
    /// No frame (including heartbeats) for this long means the socket is dead
    pub read_timeout_ms: u64,

    pub tick_history_capacity: usize,
    pub bar_history_capacity: usize,
    pub bar_interval_ms: u64,
    /// Close open bars this long after their bucket ends even without a new tick
    pub bar_stale_timeout_ms: Option<u64>,

    pub ingest_queue_capacity: usize,
    pub ingest_enqueue_timeout_ms: u64,
    pub dispatch_queue_capacity: usize,
    pub backpressure: BackpressurePolicy,

    pub stats_window_secs: u64,
    /// Zero disables the periodic stats log
    pub stats_log_interval_secs: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            feed_name: "kite".to_string(),
            ws_url: KITE_WS_URL.to_string(),
            api_key: String::new(),
            max_connections: 3,
            max_instruments_per_connection: 3000,
            placement: Placement::LeastLoaded,
            subscribe_batch_size: 100,
            reconnect_base_delay_ms: 5_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_jitter: 0.2,
            max_reconnect_attempts: 50,
            read_timeout_ms: 30_000,
            tick_history_capacity: 4096,
            bar_history_capacity: 1024,
            bar_interval_ms: 1_000,
            bar_stale_timeout_ms: None,
            ingest_queue_capacity: 10_000,
            ingest_enqueue_timeout_ms: 5,
            dispatch_queue_capacity: 10_000,
            backpressure: BackpressurePolicy::DropOldest,
            stats_window_secs: 10,
            stats_log_interval_secs: 300,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl FeedConfig {
    /// Load configuration from environment variables on top of the defaults
    ///
    /// Recognised (all optional):
    /// - `TICKFEED_WS_URL`, `TICKFEED_API_KEY`, `TICKFEED_FEED_NAME`
    /// - `TICKFEED_MAX_CONNECTIONS`, `TICKFEED_MAX_INSTRUMENTS_PER_CONNECTION`
    /// - `TICKFEED_PLACEMENT` (`least_loaded` | `first_fit`)
    /// - `TICKFEED_RECONNECT_BASE_DELAY_MS`, `TICKFEED_RECONNECT_MAX_DELAY_MS`,
    ///   `TICKFEED_MAX_RECONNECT_ATTEMPTS`
    /// - `TICKFEED_TICK_HISTORY_CAPACITY`, `TICKFEED_BAR_INTERVAL_MS`,
    ///   `TICKFEED_BAR_STALE_TIMEOUT_MS`
    /// - `TICKFEED_DISPATCH_QUEUE_CAPACITY`, `TICKFEED_DISPATCH_BLOCK_TIMEOUT_MS`
    ///   (switches the policy to block-with-timeout)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as `from_env` with an explicit variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("TICKFEED_WS_URL") {
            config.ws_url = v;
        }
        if let Some(v) = lookup("TICKFEED_API_KEY") {
            config.api_key = v;
        }
        if let Some(v) = lookup("TICKFEED_FEED_NAME") {
            config.feed_name = v;
        }
        if let Some(v) = lookup("TICKFEED_PLACEMENT") {
            config.placement = v.parse()?;
        }

        set_parsed(&lookup, "TICKFEED_MAX_CONNECTIONS", &mut config.max_connections)?;
        set_parsed(
            &lookup,
            "TICKFEED_MAX_INSTRUMENTS_PER_CONNECTION",
            &mut config.max_instruments_per_connection,
        )?;
        set_parsed(
            &lookup,
            "TICKFEED_RECONNECT_BASE_DELAY_MS",
            &mut config.reconnect_base_delay_ms,
        )?;
        set_parsed(
            &lookup,
            "TICKFEED_RECONNECT_MAX_DELAY_MS",
            &mut config.reconnect_max_delay_ms,
        )?;
        set_parsed(
            &lookup,
            "TICKFEED_MAX_RECONNECT_ATTEMPTS",
            &mut config.max_reconnect_attempts,
        )?;
        set_parsed(
            &lookup,
            "TICKFEED_TICK_HISTORY_CAPACITY",
            &mut config.tick_history_capacity,
        )?;
        set_parsed(&lookup, "TICKFEED_BAR_INTERVAL_MS", &mut config.bar_interval_ms)?;
        set_parsed(
            &lookup,
            "TICKFEED_DISPATCH_QUEUE_CAPACITY",
            &mut config.dispatch_queue_capacity,
        )?;

        let mut stale = 0u64;
        if set_parsed(&lookup, "TICKFEED_BAR_STALE_TIMEOUT_MS", &mut stale)? {
            config.bar_stale_timeout_ms = Some(stale);
        }
        let mut block = 0u64;
        if set_parsed(&lookup, "TICKFEED_DISPATCH_BLOCK_TIMEOUT_MS", &mut block)? {
            config.backpressure = BackpressurePolicy::BlockWithTimeout { timeout_ms: block };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_connections", self.max_connections),
            (
                "max_instruments_per_connection",
                self.max_instruments_per_connection,
            ),
            ("subscribe_batch_size", self.subscribe_batch_size),
            ("tick_history_capacity", self.tick_history_capacity),
            ("bar_history_capacity", self.bar_history_capacity),
            ("ingest_queue_capacity", self.ingest_queue_capacity),
            ("dispatch_queue_capacity", self.dispatch_queue_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }
        if self.bar_interval_ms == 0 {
            return Err(ConfigError::Invalid("bar_interval_ms must be > 0".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("read_timeout_ms must be > 0".into()));
        }
        if self.stats_window_secs == 0 {
            return Err(ConfigError::Invalid("stats_window_secs must be > 0".into()));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect_max_delay_ms ({}) below reconnect_base_delay_ms ({})",
                self.reconnect_max_delay_ms, self.reconnect_base_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(ConfigError::Invalid(format!(
                "reconnect_jitter must be within 0..=1, got {}",
                self.reconnect_jitter
            )));
        }
        Ok(())
    }

    /// Total instruments the pool can carry
    pub fn capacity(&self) -> usize {
        self.max_connections * self.max_instruments_per_connection
    }

    pub fn bar_interval(&self) -> Duration {
        Duration::from_millis(self.bar_interval_ms)
    }

    pub fn bar_stale_timeout(&self) -> Option<Duration> {
        self.bar_stale_timeout_ms.map(Duration::from_millis)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn ingest_enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.ingest_enqueue_timeout_ms)
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_secs(self.stats_window_secs)
    }

    pub fn stats_log_interval(&self) -> Option<Duration> {
        (self.stats_log_interval_secs > 0).then(|| Duration::from_secs(self.stats_log_interval_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Parse `name` into `target` if set. Returns whether it was set.
fn set_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) -> Result<bool, ConfigError> {
    match lookup(name) {
        Some(raw) => {
            *target = raw.trim().parse().map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value: raw.clone(),
            })?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Lookup over a fixed map, for tests and embedding
pub fn map_lookup(vars: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
    move |name| vars.get(name).cloned()
}
