//! End-to-end delivery flows over the in-memory log
//!
//! Exercises the full pipeline - publish, fanout, sequential acks, replay
//! on reconnect, retention gaps, undeliverable escalation - through the
//! public hub surface only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use taskfeed_core::{EventKind, Interest, SubscriberId, TaskEvent, TaskId};
use taskfeed_delivery::{
    DeliveryConfig, DeliveryRetryPolicy, EventLog, EventSink, InMemoryEventLog, NotificationHub,
    RetentionPolicy, SinkError,
};

/// What a test sink observed, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
enum Delivered {
    Event(TaskId, u64),
    Missed(TaskId, u64),
}

/// Sink that records deliveries and (by default) acks them immediately,
/// the way a healthy gateway connection would
struct TestSink {
    hub: Arc<NotificationHub>,
    subscriber: SubscriberId,
    auto_ack: bool,
    fail: AtomicBool,
    tx: mpsc::UnboundedSender<Delivered>,
}

impl TestSink {
    fn attach(
        hub: &Arc<NotificationHub>,
        subscriber: &SubscriberId,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Delivered>) {
        Self::attach_with(hub, subscriber, true, false)
    }

    fn attach_with(
        hub: &Arc<NotificationHub>,
        subscriber: &SubscriberId,
        auto_ack: bool,
        fail: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Delivered>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            hub: Arc::clone(hub),
            subscriber: subscriber.clone(),
            auto_ack,
            fail: AtomicBool::new(fail),
            tx,
        });
        (sink, rx)
    }
}

#[async_trait]
impl EventSink for TestSink {
    async fn send(&self, event: &TaskEvent) -> Result<(), SinkError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected("injected failure".to_string()));
        }
        let _ = self
            .tx
            .send(Delivered::Event(event.task_id, event.sequence));
        if self.auto_ack {
            self.hub.ack(&self.subscriber, event.task_id, event.sequence);
        }
        Ok(())
    }

    async fn notify_missed(&self, task_id: TaskId, floor: u64) -> Result<(), SinkError> {
        let _ = self.tx.send(Delivered::Missed(task_id, floor));
        Ok(())
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Delivered>) -> Delivered {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("sink channel closed")
}

async fn expect_events(rx: &mut mpsc::UnboundedReceiver<Delivered>, task: TaskId, seqs: &[u64]) {
    for seq in seqs {
        assert_eq!(next(rx).await, Delivered::Event(task, *seq));
    }
}

async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<Delivered>) {
    match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(delivered)) => panic!("expected no delivery, got {delivered:?}"),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 4s");
}

fn fast_config() -> DeliveryConfig {
    DeliveryConfig::default()
        .with_send_timeout(Duration::from_millis(200))
        .with_ack_timeout(Duration::from_millis(200))
}

async fn publish_n(hub: &NotificationHub, task: TaskId, from: u64, to: u64) {
    for n in from..=to {
        let ack = hub
            .publish(task, EventKind::Updated, format!("v{n}").into_bytes())
            .await
            .expect("publish failed");
        assert_eq!(ack.sequence, n);
    }
}

#[test_log::test(tokio::test)]
async fn test_backlog_then_live_in_order() {
    let hub = Arc::new(NotificationHub::in_memory(fast_config()));
    let task = TaskId::new();
    let sub = SubscriberId::from("viewer-1");

    // Backlog exists before the subscriber ever connects
    publish_n(&hub, task, 1, 5).await;

    hub.subscribe(sub.clone(), Interest::All);
    let (sink, mut rx) = TestSink::attach(&hub, &sub);
    hub.connect(&sub, sink).await.unwrap();

    // Catch-up precedes live tailing
    expect_events(&mut rx, task, &[1, 2, 3, 4, 5]).await;
    wait_until(|| hub.is_caught_up(&sub, task)).await;

    // Live events continue the same ordered stream
    publish_n(&hub, task, 6, 7).await;
    expect_events(&mut rx, task, &[6, 7]).await;

    wait_until(|| hub.cursor(&sub, task) == Some(7)).await;
    hub.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_reconnect_replays_gap_without_duplicates() {
    let hub = Arc::new(NotificationHub::in_memory(fast_config()));
    let task = TaskId::new();
    let sub = SubscriberId::from("viewer-1");

    // The subscriber consumed up to 3 on a previous connection
    hub.subscribe(sub.clone(), Interest::tasks([task]));
    hub.ack(&sub, task, 3);

    publish_n(&hub, task, 1, 7).await;

    let (sink, mut rx) = TestSink::attach(&hub, &sub);
    hub.connect(&sub, sink).await.unwrap();

    // Replay resumes after the cursor: 4..7, never 1..3 again
    expect_events(&mut rx, task, &[4, 5, 6, 7]).await;

    // And live continues from there
    publish_n(&hub, task, 8, 8).await;
    expect_events(&mut rx, task, &[8]).await;
    hub.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_disconnect_reconnect_resumes_from_cursor() {
    let hub = Arc::new(NotificationHub::in_memory(fast_config()));
    let task = TaskId::new();
    let sub = SubscriberId::from("viewer-1");

    hub.subscribe(sub.clone(), Interest::All);
    let (first_sink, mut first_rx) = TestSink::attach(&hub, &sub);
    hub.connect(&sub, first_sink).await.unwrap();

    publish_n(&hub, task, 1, 5).await;
    expect_events(&mut first_rx, task, &[1, 2, 3, 4, 5]).await;

    hub.disconnect(&sub).unwrap();
    assert!(!hub.is_connected(&sub));

    // Events keep accumulating while disconnected; the cursor survives
    wait_until(|| hub.cursor(&sub, task) == Some(5)).await;
    publish_n(&hub, task, 6, 7).await;
    assert_eq!(hub.cursor(&sub, task), Some(5));

    let (second_sink, mut second_rx) = TestSink::attach(&hub, &sub);
    hub.connect(&sub, second_sink).await.unwrap();

    expect_events(&mut second_rx, task, &[6, 7]).await;
    expect_silence(&mut first_rx).await;
    hub.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_fanout_respects_interest() {
    let hub = Arc::new(NotificationHub::in_memory(fast_config()));
    let watched = TaskId::new();
    let other = TaskId::new();

    let everything = SubscriberId::from("board-view");
    let focused = SubscriberId::from("task-view");

    hub.subscribe(everything.clone(), Interest::All);
    hub.subscribe(focused.clone(), Interest::tasks([watched]));

    let (all_sink, mut all_rx) = TestSink::attach(&hub, &everything);
    let (one_sink, mut one_rx) = TestSink::attach(&hub, &focused);
    hub.connect(&everything, all_sink).await.unwrap();
    hub.connect(&focused, one_sink).await.unwrap();

    publish_n(&hub, watched, 1, 2).await;
    publish_n(&hub, other, 1, 1).await;

    // The focused subscriber sees only its task
    expect_events(&mut one_rx, watched, &[1, 2]).await;
    expect_silence(&mut one_rx).await;

    // The broad subscriber sees both partitions (cross-partition order is
    // unspecified, so collect and sort)
    let mut seen = vec![next(&mut all_rx).await, next(&mut all_rx).await, next(&mut all_rx).await];
    seen.sort_by_key(|d| match d {
        Delivered::Event(t, s) => (*t, *s),
        Delivered::Missed(t, f) => (*t, *f),
    });
    let mut expected = vec![
        Delivered::Event(watched, 1),
        Delivered::Event(watched, 2),
        Delivered::Event(other, 1),
    ];
    expected.sort_by_key(|d| match d {
        Delivered::Event(t, s) => (*t, *s),
        Delivered::Missed(t, f) => (*t, *f),
    });
    assert_eq!(seen, expected);
    hub.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_out_of_order_acks_do_not_regress_cursor() {
    let hub = Arc::new(NotificationHub::in_memory(fast_config()));
    let task = TaskId::new();
    let sub = SubscriberId::from("viewer-1");
    hub.subscribe(sub.clone(), Interest::All);

    hub.ack(&sub, task, 3);
    hub.ack(&sub, task, 2);
    assert_eq!(hub.cursor(&sub, task), Some(3));
}

#[test_log::test(tokio::test)]
async fn test_named_task_delivers_before_first_event_exists() {
    let hub = Arc::new(NotificationHub::in_memory(fast_config()));
    let task = TaskId::new();
    let sub = SubscriberId::from("viewer-1");

    // Connect while the partition does not exist yet
    hub.subscribe(sub.clone(), Interest::tasks([task]));
    let (sink, mut rx) = TestSink::attach(&hub, &sub);
    hub.connect(&sub, sink).await.unwrap();

    publish_n(&hub, task, 1, 2).await;
    expect_events(&mut rx, task, &[1, 2]).await;
    hub.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_first_append_fans_out_even_with_preexisting_watcher() {
    let hub = Arc::new(NotificationHub::in_memory(fast_config()));
    let task = TaskId::new();

    // A named-interest subscriber connects first: its loop tails the
    // not-yet-existing partition
    let focused = SubscriberId::from("task-view");
    hub.subscribe(focused.clone(), Interest::tasks([task]));
    let (focused_sink, mut focused_rx) = TestSink::attach(&hub, &focused);
    hub.connect(&focused, focused_sink).await.unwrap();

    // A broad subscriber connects while the partition still has no events
    let broad = SubscriberId::from("board-view");
    hub.subscribe(broad.clone(), Interest::All);
    let (broad_sink, mut broad_rx) = TestSink::attach(&hub, &broad);
    hub.connect(&broad, broad_sink).await.unwrap();

    // The first real append must reach both
    publish_n(&hub, task, 1, 1).await;
    expect_events(&mut focused_rx, task, &[1]).await;
    expect_events(&mut broad_rx, task, &[1]).await;
    hub.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_retention_gap_surfaces_missed_events() {
    let log = Arc::new(InMemoryEventLog::with_retention(
        RetentionPolicy::unbounded().with_max_events(2),
    ));
    let hub = Arc::new(NotificationHub::new(log, fast_config()));
    let task = TaskId::new();
    let sub = SubscriberId::from("viewer-1");

    // Only 5 and 6 are retained; the floor is 5
    publish_n(&hub, task, 1, 6).await;

    hub.subscribe(sub.clone(), Interest::All);
    let (sink, mut rx) = TestSink::attach(&hub, &sub);
    hub.connect(&sub, sink).await.unwrap();

    // The gap is explicit: a notice carrying the floor, then delivery
    // resumes after it
    assert_eq!(next(&mut rx).await, Delivered::Missed(task, 5));
    expect_events(&mut rx, task, &[6]).await;

    wait_until(|| hub.cursor(&sub, task) == Some(6)).await;
    hub.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_undeliverable_escalates_and_disconnects() {
    let config = DeliveryConfig::default()
        .with_send_timeout(Duration::from_millis(100))
        .with_ack_timeout(Duration::from_millis(100))
        .with_retry(
            DeliveryRetryPolicy::default()
                .with_max_attempts(2)
                .with_initial_interval(Duration::from_millis(10))
                .with_jitter(0.0),
        );
    let hub = Arc::new(NotificationHub::in_memory(config));
    let task = TaskId::new();
    let sub = SubscriberId::from("broken-client");

    hub.subscribe(sub.clone(), Interest::All);
    let (sink, _rx) = TestSink::attach_with(&hub, &sub, true, true);
    hub.connect(&sub, sink).await.unwrap();

    publish_n(&hub, task, 1, 1).await;

    // Ceiling reached: reported, and the subscriber is forced through a
    // future reconnect instead of silently skipping the event
    wait_until(|| !hub.is_connected(&sub)).await;
    wait_until(|| !hub.undeliverable().is_empty()).await;

    let reports = hub.undeliverable();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].subscriber_id, sub);
    assert_eq!(reports[0].task_id, task);
    assert_eq!(reports[0].sequence, 1);
    assert_eq!(reports[0].attempts, 2);

    // The event itself is never dropped from the log
    assert_eq!(hub.log().head(task).await.unwrap(), 1);
    assert_eq!(hub.cursor(&sub, task), Some(0));
    hub.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_slow_subscriber_does_not_stall_others() {
    let hub = Arc::new(NotificationHub::in_memory(fast_config()));
    let task = TaskId::new();

    let stuck = SubscriberId::from("stuck-client");
    let healthy = SubscriberId::from("healthy-client");
    hub.subscribe(stuck.clone(), Interest::All);
    hub.subscribe(healthy.clone(), Interest::All);

    // The stuck sink accepts sends but never acks, so its loop sits in
    // ack-timeout/backoff cycles
    let (stuck_sink, mut stuck_rx) = TestSink::attach_with(&hub, &stuck, false, false);
    let (healthy_sink, mut healthy_rx) = TestSink::attach(&hub, &healthy);
    hub.connect(&stuck, stuck_sink).await.unwrap();
    hub.connect(&healthy, healthy_sink).await.unwrap();

    publish_n(&hub, task, 1, 3).await;

    expect_events(&mut healthy_rx, task, &[1, 2, 3]).await;

    // The stuck subscriber saw only resends of the first event
    assert_eq!(next(&mut stuck_rx).await, Delivered::Event(task, 1));
    assert_eq!(hub.cursor(&stuck, task), Some(0));
    hub.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_unsubscribe_stops_delivery_promptly() {
    let hub = Arc::new(NotificationHub::in_memory(fast_config()));
    let task = TaskId::new();
    let sub = SubscriberId::from("viewer-1");

    hub.subscribe(sub.clone(), Interest::All);
    let (sink, mut rx) = TestSink::attach(&hub, &sub);
    hub.connect(&sub, sink).await.unwrap();

    publish_n(&hub, task, 1, 1).await;
    expect_events(&mut rx, task, &[1]).await;

    hub.unsubscribe(&sub).unwrap();

    publish_n(&hub, task, 2, 2).await;
    expect_silence(&mut rx).await;

    // Acks for a removed subscriber are idempotent no-ops
    hub.ack(&sub, task, 2);
    assert_eq!(hub.cursor(&sub, task), None);
    assert!(hub.unsubscribe(&sub).is_err());
    hub.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_rapid_reconnect_never_crosses_connections() {
    let hub = Arc::new(NotificationHub::in_memory(fast_config()));
    let task = TaskId::new();
    let sub = SubscriberId::from("viewer-1");

    hub.subscribe(sub.clone(), Interest::All);
    let (first_sink, mut first_rx) = TestSink::attach(&hub, &sub);
    hub.connect(&sub, first_sink).await.unwrap();

    publish_n(&hub, task, 1, 1).await;
    expect_events(&mut first_rx, task, &[1]).await;

    // Flip connections back-to-back; the old loops are fenced out by epoch
    hub.disconnect(&sub).unwrap();
    let (second_sink, mut second_rx) = TestSink::attach(&hub, &sub);
    hub.connect(&sub, second_sink).await.unwrap();

    publish_n(&hub, task, 2, 2).await;
    expect_events(&mut second_rx, task, &[2]).await;
    expect_silence(&mut second_rx).await;
    expect_silence(&mut first_rx).await;
    hub.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_shutdown_stops_all_loops() {
    let hub = Arc::new(NotificationHub::in_memory(fast_config()));
    let task = TaskId::new();
    let sub = SubscriberId::from("viewer-1");

    hub.subscribe(sub.clone(), Interest::All);
    let (sink, mut rx) = TestSink::attach(&hub, &sub);
    hub.connect(&sub, sink).await.unwrap();

    publish_n(&hub, task, 1, 1).await;
    expect_events(&mut rx, task, &[1]).await;

    hub.shutdown().await;

    // Appends still succeed (the log outlives delivery) but nothing is
    // pushed anymore
    publish_n(&hub, task, 2, 2).await;
    expect_silence(&mut rx).await;
}
