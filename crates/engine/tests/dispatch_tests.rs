//! Consumer fan-out through a running feed.
//!
//! - A failing consumer is isolated and counted
//! - A stuck consumer triggers the backpressure policy while ingestion
//!   keeps storing ticks
//! - A saturated ingest queue drops ticks without holding up socket reads
//!
//! Run with: cargo test -p tickfeed-engine --test dispatch_tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tickfeed_engine::test_helpers::*;
use tickfeed_engine::{
    BackpressurePolicy, Consumer, ConsumerError, FeedConfig, FeedEngine, Mode, Tick, TickFn,
};

const WAIT: Duration = Duration::from_secs(5);

/// Fails every third tick it sees
#[derive(Default)]
struct EveryThirdFails {
    calls: AtomicUsize,
}

impl Consumer for EveryThirdFails {
    fn on_tick(&self, _tick: &Tick) -> Result<(), ConsumerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n % 3 == 0 {
            return Err(format!("call {} rejected", n).into());
        }
        Ok(())
    }
}

/// Blocks in its first callback until released
#[derive(Default)]
struct Stuck {
    released: AtomicBool,
    entered: AtomicUsize,
}

impl Consumer for Stuck {
    fn on_tick(&self, _tick: &Tick) -> Result<(), ConsumerError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        while !self.released.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}

async fn running_feed(config: FeedConfig) -> (MockTransport, FeedEngine) {
    let mock = MockTransport::new();
    let feed = FeedEngine::new(config, Arc::new(mock.clone()), "token").unwrap();
    feed.subscribe(&[1], Mode::Ltp).unwrap();
    (mock, feed)
}

#[tokio::test]
async fn test_failing_consumer_isolated_from_good_one() {
    let (mock, feed) = running_feed(fast_config(1, 10)).await;
    let flaky = Arc::new(EveryThirdFails::default());
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    feed.register(flaky.clone());
    feed.register(Arc::new(TickFn::new(move |_tick: &Tick| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })));

    let _events = feed.start().await.unwrap();
    assert!(eventually(WAIT, || mock.subscribed_tokens(0).len() == 1).await);
    for i in 0..100 {
        mock.push_binary(0, ltp_message(&[(1, 100.0 + i as f64)]));
    }

    assert!(eventually(WAIT, || delivered.load(Ordering::SeqCst) == 100).await);
    assert!(eventually(WAIT, || feed.statistics().callback_error_count == 33).await);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 100);

    feed.stop().await.unwrap();
    assert_eq!(feed.statistics().callback_error_count, 33);
    assert_eq!(feed.statistics().total_ticks, 100);
}

#[tokio::test]
async fn test_stuck_consumer_drops_oldest_without_stalling_ingest() {
    let config = FeedConfig {
        dispatch_queue_capacity: 4,
        backpressure: BackpressurePolicy::DropOldest,
        // keep every tick in one bar so only ticks hit the queue
        bar_interval_ms: 86_400_000,
        ..fast_config(1, 10)
    };
    let (mock, feed) = running_feed(config).await;
    let stuck = Arc::new(Stuck::default());
    feed.register(stuck.clone());

    let _events = feed.start().await.unwrap();
    assert!(eventually(WAIT, || mock.subscribed_tokens(0).len() == 1).await);

    // First tick parks the worker, the next 4 fill the queue
    mock.push_binary(0, ltp_message(&[(1, 1.0)]));
    assert!(eventually(WAIT, || stuck.entered.load(Ordering::SeqCst) == 1).await);
    for i in 0..5 {
        mock.push_binary(0, ltp_message(&[(1, 2.0 + i as f64)]));
    }

    assert!(eventually(WAIT, || feed.statistics().total_ticks == 6).await);
    let stats = feed.statistics();
    assert_eq!(stats.dispatch_dropped, 1);
    assert_eq!(stats.ingest_dropped, 0);
    assert_eq!(feed.latest_ticks(1, 10).len(), 6);

    stuck.released.store(true, Ordering::SeqCst);
    feed.stop().await.unwrap();
}

#[tokio::test]
async fn test_block_with_timeout_drops_new_events() {
    let config = FeedConfig {
        dispatch_queue_capacity: 2,
        backpressure: BackpressurePolicy::BlockWithTimeout { timeout_ms: 10 },
        bar_interval_ms: 86_400_000,
        ..fast_config(1, 10)
    };
    let (mock, feed) = running_feed(config).await;
    let stuck = Arc::new(Stuck::default());
    feed.register(stuck.clone());

    let _events = feed.start().await.unwrap();
    assert!(eventually(WAIT, || mock.subscribed_tokens(0).len() == 1).await);

    mock.push_binary(0, ltp_message(&[(1, 1.0)]));
    assert!(eventually(WAIT, || stuck.entered.load(Ordering::SeqCst) == 1).await);
    for i in 0..4 {
        mock.push_binary(0, ltp_message(&[(1, 2.0 + i as f64)]));
    }

    assert!(eventually(WAIT, || feed.statistics().total_ticks == 5).await);
    assert_eq!(feed.statistics().dispatch_dropped, 2);
    assert_eq!(feed.latest_ticks(1, 10).len(), 5);

    stuck.released.store(true, Ordering::SeqCst);
    feed.stop().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_consumer_stops_receiving() {
    let (mock, feed) = running_feed(fast_config(1, 10)).await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let handle = feed.register(Arc::new(TickFn::new(move |_tick: &Tick| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })));

    let _events = feed.start().await.unwrap();
    assert!(eventually(WAIT, || mock.subscribed_tokens(0).len() == 1).await);
    mock.push_binary(0, ltp_message(&[(1, 1.0)]));
    assert!(eventually(WAIT, || seen.load(Ordering::SeqCst) == 1).await);

    assert!(feed.unregister(handle));
    assert!(!feed.unregister(handle));
    mock.push_binary(0, ltp_message(&[(1, 2.0)]));
    assert!(eventually(WAIT, || feed.statistics().total_ticks == 2).await);

    feed.stop().await.unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_full_ingest_queue_does_not_stall_socket_reads() {
    let config = FeedConfig {
        ingest_queue_capacity: 1,
        ingest_enqueue_timeout_ms: 50,
        dispatch_queue_capacity: 1,
        backpressure: BackpressurePolicy::BlockWithTimeout { timeout_ms: 60_000 },
        bar_interval_ms: 86_400_000,
        ..fast_config(1, 10)
    };
    let (mock, feed) = running_feed(config).await;
    let stuck = Arc::new(Stuck::default());
    feed.register(stuck.clone());

    let _events = feed.start().await.unwrap();
    assert!(eventually(WAIT, || mock.subscribed_tokens(0).len() == 1).await);

    // Wedge the pipeline: consumer parked, dispatch queue full, ingest
    // worker blocked on dispatch, ingest queue full
    mock.push_binary(0, ltp_message(&[(1, 1.0)]));
    assert!(eventually(WAIT, || stuck.entered.load(Ordering::SeqCst) == 1).await);
    mock.push_binary(0, ltp_message(&[(1, 2.0)]));
    assert!(eventually(WAIT, || feed.statistics().total_ticks == 2).await);
    mock.push_binary(0, ltp_message(&[(1, 3.0)]));
    mock.push_binary(0, ltp_message(&[(1, 4.0)]));

    let burst: Vec<(u32, f64)> = (0..60).map(|i| (1, 10.0 + i as f64)).collect();
    let pushed_at = std::time::Instant::now();
    mock.push_binary(0, ltp_message(&burst));
    mock.push_text(0, r#"{"type":"error","data":"after burst"}"#);

    assert!(eventually(WAIT, || feed.statistics().server_errors == 1).await);
    let stalled = pushed_at.elapsed();
    assert!(
        stalled < Duration::from_millis(1_000),
        "read loop held for {:?} by one message",
        stalled
    );
    assert!(feed.statistics().ingest_dropped >= 60);

    stuck.released.store(true, Ordering::SeqCst);
    feed.stop().await.unwrap();
}
