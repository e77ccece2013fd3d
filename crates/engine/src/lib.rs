//! tickfeed-engine: multi-connection tick ingestion
//!
//! A fixed pool of WebSocket connections feeds one bounded ingest queue. A
//! dedicated worker stores each tick in a per-instrument ring buffer, rolls it
//! into OHLC bars and hands both to registered consumers through a bounded
//! dispatch queue.

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod ingest;
pub mod metrics;
pub mod pool;
pub mod router;
pub mod slot;
pub mod stats;
pub mod store;
pub mod test_helpers;
pub mod transport;
pub mod websocket;

pub use aggregator::{Aggregation, AggregationEngine};
pub use config::{BackpressurePolicy, FeedConfig, Placement, KITE_WS_URL};
pub use dispatcher::{BarFn, Consumer, ConsumerHandle, ConsumerRegistry, MarketEvent, TickFn};
pub use engine::FeedEngine;
pub use error::{ConfigError, ConsumerError, FeedError, SlotError};
pub use event::FeedEvent;
pub use pool::ConnectionPool;
pub use router::{SharedRouter, SubscriptionRouter};
pub use slot::{SlotState, SlotStatus};
pub use stats::{SlotSnapshot, StatisticsCollector, StatsSnapshot};
pub use store::RingBufferStore;
pub use transport::{FeedStream, FeedTransport, InboundFrame};
pub use websocket::KiteTransport;

pub use tickfeed_wire::{InstrumentToken, Mode, OhlcBar, Tick, TickKind};
