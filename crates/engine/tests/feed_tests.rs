//! End-to-end feed tests over the scripted in-memory transport.
//!
//! Cover the pool and router scenarios:
//! - Capacity is enforced across slots
//! - A dropped slot replays exactly its token set
//! - Session rejection parks a slot until a new token arrives
//! - Exhausted slots degrade, evacuate, and total loss is reported
//! - Shutdown flushes open bars to consumers
//!
//! Run with: cargo test -p tickfeed-engine --test feed_tests

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tickfeed_engine::test_helpers::*;
use tickfeed_engine::{
    BarFn, Consumer, FeedConfig, FeedEngine, FeedError, FeedEvent, InstrumentToken, Mode, OhlcBar,
    SlotState,
};
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

/// Surface engine logs with RUST_LOG=tickfeed_engine=debug
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn build(mock: &MockTransport, config: FeedConfig) -> FeedEngine {
    init_tracing();
    FeedEngine::new(config, Arc::new(mock.clone()), "token-1").expect("valid config")
}

/// Wait for the first event matching `pred`, skipping others
async fn expect_event(
    events: &mut UnboundedReceiver<FeedEvent>,
    pred: impl Fn(&FeedEvent) -> bool,
) -> FeedEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event before timeout")
}

fn bar_collector() -> (Arc<Mutex<Vec<OhlcBar>>>, Arc<dyn Consumer>) {
    let bars = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&bars);
    let consumer: Arc<dyn Consumer> = Arc::new(BarFn::new(move |bar: &OhlcBar| {
        sink.lock().unwrap().push(*bar);
        Ok(())
    }));
    (bars, consumer)
}

// =============================================================================
// Capacity
// =============================================================================

#[tokio::test]
async fn test_9000_quote_instruments_fill_three_slots() {
    let mock = MockTransport::new();
    let feed = build(&mock, fast_config(3, 3000));

    let tokens: Vec<InstrumentToken> = (1..=9000).collect();
    assert_eq!(feed.subscribe(&tokens, Mode::Quote).unwrap(), 9000);
    assert_eq!(feed.router().read().shape(), vec![3000, 3000, 3000]);

    let err = feed.subscribe(&[9001], Mode::Quote).unwrap_err();
    assert!(matches!(
        err,
        FeedError::CapacityExceeded {
            requested: 1,
            available: 0
        }
    ));
    assert!(!feed.router().read().is_subscribed(9001));

    let _events = feed.start().await.unwrap();
    for slot in 0..3 {
        assert!(
            eventually(WAIT, || mock.subscribed_tokens(slot).len() == 3000).await,
            "slot {} not fully subscribed",
            slot
        );
    }
    let all: BTreeSet<InstrumentToken> = (0..3).flat_map(|s| mock.subscribed_tokens(s)).collect();
    assert_eq!(all.len(), 9000);

    feed.stop().await.unwrap();
}

#[tokio::test]
async fn test_resubscribe_after_unsubscribe_keeps_shape() {
    let mock = MockTransport::new();
    let feed = build(&mock, fast_config(3, 100));
    let tokens: Vec<InstrumentToken> = (1..=250).collect();

    feed.subscribe(&tokens, Mode::Ltp).unwrap();
    let shape = feed.router().read().shape();
    assert_eq!(feed.unsubscribe(&tokens).await, 250);
    assert!(feed.router().read().is_empty());
    feed.subscribe(&tokens, Mode::Ltp).unwrap();
    assert_eq!(feed.router().read().shape(), shape);
}

// =============================================================================
// Reconnect replay
// =============================================================================

#[tokio::test]
async fn test_dropped_slot_replays_500_tokens_once() {
    let mock = MockTransport::new();
    let feed = build(&mock, fast_config(1, 3000));
    let tokens: Vec<InstrumentToken> = (1..=500).collect();
    let expected: BTreeSet<InstrumentToken> = tokens.iter().copied().collect();

    feed.subscribe(&tokens, Mode::Full).unwrap();
    let mut events = feed.start().await.unwrap();
    assert!(eventually(WAIT, || mock.subscribed_tokens(0).len() == 500).await);

    assert!(mock.drop_connection(0, "connection reset by peer"));
    let event = expect_event(&mut events, |e| matches!(e, FeedEvent::SlotRecovered { .. })).await;
    assert_eq!(event, FeedEvent::SlotRecovered { slot: 0 });

    assert_eq!(mock.connection_count(0), 2);
    assert_eq!(feed.slots_for_replay(0), expected);
    let requests = mock.subscribe_requests(0);
    assert_eq!(requests.len(), 500, "no duplicate subscribe on replay");
    assert_eq!(requests.into_iter().collect::<BTreeSet<_>>(), expected);
    // Mode is restored with the tokens
    assert!(mock
        .sent_frames(0)
        .iter()
        .any(|f| f.starts_with(r#"{"a":"mode","v":["full""#)));

    let stats = feed.statistics();
    assert_eq!(stats.slots[0].state, SlotState::Subscribed);
    assert_eq!(stats.slots[0].tokens, 500);
    feed.stop().await.unwrap();
}

// =============================================================================
// Session rejection
// =============================================================================

#[tokio::test]
async fn test_auth_rejection_waits_for_new_token() {
    let mock = MockTransport::new();
    mock.script(0, [ConnectBehavior::AuthReject("403 Forbidden".into())]);
    let feed = build(&mock, fast_config(1, 10));
    feed.subscribe(&[1, 2], Mode::Ltp).unwrap();

    let mut events = feed.start().await.unwrap();
    let event = expect_event(&mut events, |e| matches!(e, FeedEvent::AuthExpired { .. })).await;
    assert!(matches!(event, FeedEvent::AuthExpired { slot: 0, .. }));

    // Parked: no retry with the rejected token
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.connect_count(0), 1);
    assert_eq!(feed.statistics().slots[0].state, SlotState::Disconnected);

    feed.set_access_token("token-2");
    assert!(eventually(WAIT, || mock.subscribed_tokens(0).len() == 2).await);
    assert_eq!(mock.tokens_presented(0), vec!["token-1", "token-2"]);
    assert_eq!(mock.latest_access_token(0).as_deref(), Some("token-2"));

    feed.stop().await.unwrap();
}

// =============================================================================
// Degradation
// =============================================================================

#[tokio::test]
async fn test_degraded_slot_evacuates_then_feed_lost_then_reset() {
    let mock = MockTransport::new();
    // 3 attempts allowed: the drop counts as the first failure
    let feed = build(&mock, fast_config(2, 10));
    feed.subscribe(&[1, 2, 3, 4], Mode::Quote).unwrap();
    let mut events = feed.start().await.unwrap();
    assert!(eventually(WAIT, || mock.subscribed_tokens(0).len() == 2
        && mock.subscribed_tokens(1).len() == 2)
    .await);

    let fail = ConnectBehavior::Fail("connection refused".into());
    mock.script(0, vec![fail.clone(); 3]);
    mock.drop_connection(0, "reset");
    let event = expect_event(&mut events, |e| matches!(e, FeedEvent::SlotDegraded { .. })).await;
    assert_eq!(
        event,
        FeedEvent::SlotDegraded {
            slot: 0,
            attempts: 4,
            moved: 2,
            stranded: 0
        }
    );
    assert!(eventually(WAIT, || mock.subscribed_tokens(1).len() == 4).await);
    assert_eq!(feed.slots_for_replay(1).len(), 4);
    assert!(feed.slots_for_replay(0).is_empty());
    assert_eq!(feed.statistics().slots[0].state, SlotState::Degraded);
    assert_eq!(feed.statistics().active_connections, 1);

    // Second slot goes too: nowhere to move, total loss
    mock.script(1, vec![fail; 3]);
    mock.drop_connection(1, "reset");
    let event = expect_event(&mut events, |e| matches!(e, FeedEvent::SlotDegraded { .. })).await;
    assert_eq!(
        event,
        FeedEvent::SlotDegraded {
            slot: 1,
            attempts: 4,
            moved: 0,
            stranded: 4
        }
    );
    let event = expect_event(&mut events, |e| matches!(e, FeedEvent::FeedLost { .. })).await;
    assert_eq!(event, FeedEvent::FeedLost { slots: 2 });
    // Stranded tokens stay mapped
    assert_eq!(feed.slots_for_replay(1).len(), 4);

    assert!(matches!(
        feed.reset_slot(7).await,
        Err(FeedError::UnknownSlot(7))
    ));
    feed.reset_slot(1).await.unwrap();
    assert!(matches!(
        feed.reset_slot(1).await,
        Err(FeedError::SlotNotDegraded(1))
    ));
    assert!(eventually(WAIT, || mock.subscribed_tokens(1).len() == 4).await);
    assert!(eventually(WAIT, || feed.statistics().slots[1].state == SlotState::Subscribed).await);

    feed.stop().await.unwrap();
}

// =============================================================================
// Ticks, bars, shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_flushes_open_bar() {
    let mock = MockTransport::new();
    let feed = build(&mock, fast_config(1, 10));
    let (bars, consumer) = bar_collector();
    feed.register(consumer);
    feed.subscribe(&[1], Mode::Ltp).unwrap();
    let _events = feed.start().await.unwrap();
    assert!(eventually(WAIT, || mock.subscribed_tokens(0).len() == 1).await);

    // One message: one arrival timestamp, one bucket
    mock.push_binary(0, ltp_message(&[(1, 100.0), (1, 105.0), (1, 98.0), (1, 102.0)]));
    assert!(eventually(WAIT, || feed.latest_ticks(1, 10).len() == 4).await);
    let open = feed.current_bar(1).expect("open bar");
    assert_eq!(open.tick_count, 4);

    feed.stop().await.unwrap();

    let bars = bars.lock().unwrap().clone();
    assert_eq!(bars.len(), 1);
    let bar = &bars[0];
    assert_eq!(
        (bar.open, bar.high, bar.low, bar.close, bar.tick_count),
        (100.0, 105.0, 98.0, 102.0, 4)
    );
    assert_eq!(feed.latest_bars(1, 10), bars);
    assert!(feed.current_bar(1).is_none());
    assert!(matches!(feed.stop().await, Err(FeedError::NotRunning)));
}

#[tokio::test]
async fn test_unsubscribe_closes_bar_and_filters_late_ticks() {
    let mock = MockTransport::new();
    let feed = build(&mock, fast_config(1, 10));
    let (bars, consumer) = bar_collector();
    feed.register(consumer);
    feed.subscribe(&[1, 2], Mode::Ltp).unwrap();
    let _events = feed.start().await.unwrap();
    assert!(eventually(WAIT, || mock.subscribed_tokens(0).len() == 2).await);

    mock.push_binary(0, ltp_message(&[(1, 10.0), (2, 20.0)]));
    assert!(eventually(WAIT, || feed.statistics().total_ticks == 2).await);

    assert_eq!(feed.unsubscribe(&[2, 99]).await, 1);
    assert!(eventually(WAIT, || bars.lock().unwrap().iter().any(|b| b.token == 2)).await);
    assert!(eventually(WAIT, || mock.subscribed_tokens(0) == BTreeSet::from([1])).await);

    // Still in flight from the server after the unsubscribe
    mock.push_binary(0, ltp_message(&[(2, 21.0), (1, 11.0)]));
    assert!(eventually(WAIT, || feed.statistics().total_ticks == 3).await);
    assert_eq!(feed.latest_ticks(2, 10).len(), 1);
    assert_eq!(feed.latest_ticks(1, 10).len(), 2);

    feed.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frames_are_counted_not_fatal() {
    let mock = MockTransport::new();
    let feed = build(&mock, fast_config(1, 10));
    feed.subscribe(&[1], Mode::Ltp).unwrap();
    let _events = feed.start().await.unwrap();
    assert!(eventually(WAIT, || mock.subscribed_tokens(0).len() == 1).await);

    // One packet of an unknown length
    mock.push_binary(0, vec![0, 1, 0, 5, 1, 2, 3, 4, 5]);
    mock.push_text(0, "not json");
    mock.push_text(0, r#"{"type":"error","data":"invalid token"}"#);
    mock.push_binary(0, vec![0]);
    mock.push_binary(0, ltp_message(&[(1, 50.0)]));

    assert!(eventually(WAIT, || feed.statistics().total_ticks == 1).await);
    let stats = feed.statistics();
    assert_eq!(stats.malformed_frames, 2);
    assert_eq!(stats.server_errors, 1);
    assert_eq!(stats.slots[0].state, SlotState::Subscribed);
    assert_eq!(stats.slots[0].frames_received, 5);
    assert_eq!(mock.connection_count(0), 1);

    let text = feed.metrics_text().unwrap();
    assert!(text.contains("tickfeed_malformed_frames_total"));

    feed.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let mock = MockTransport::new();
    let feed = build(&mock, fast_config(1, 10));
    let _events = feed.start().await.unwrap();
    assert!(matches!(feed.start().await, Err(FeedError::AlreadyStarted)));
    feed.stop().await.unwrap();
    assert!(matches!(feed.start().await, Err(FeedError::AlreadyStarted)));
}

#[test]
fn test_invalid_config_rejected() {
    let mock = MockTransport::new();
    let config = FeedConfig {
        max_connections: 0,
        ..fast_config(1, 10)
    };
    let err = FeedEngine::new(config, Arc::new(mock), "t").err().unwrap();
    assert!(matches!(err, FeedError::Config(_)));
}
