//! End-to-end delivery scenarios against a scripted backend.

use courier_engine::{
    BackendCall, BackendClient, BroadcastEvent, Clock, EngineConfig, ErrorKind, ManualClock,
    MessageStatus, MoMessage, MockBackend, RecordingBroadcaster, RetryPolicy, SyncEngine,
    SyncError, SyncResult, TransportError,
};
use courier_storage::{InMemoryStore, KeyValueStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

const T0: i64 = 1_700_000_000_000;
const HOUR: Duration = Duration::from_secs(3600);

struct Fixture {
    engine: SyncEngine,
    backend: Arc<MockBackend>,
    calls: mpsc::UnboundedReceiver<BackendCall>,
    clock: Arc<ManualClock>,
    broadcaster: Arc<RecordingBroadcaster>,
}

fn fixture(config: EngineConfig) -> Fixture {
    let (backend, calls) = MockBackend::with_observer();
    let backend = Arc::new(backend);
    let clock = Arc::new(ManualClock::new(T0));
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let engine = SyncEngine::builder(
        Arc::clone(&backend) as Arc<dyn BackendClient>,
        Arc::new(InMemoryStore::new()) as Arc<dyn KeyValueStore>,
    )
    .with_config(config)
    .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
    .with_broadcaster(Arc::clone(&broadcaster) as Arc<dyn courier_engine::Broadcaster>)
    .build()
    .unwrap();
    engine
        .installation()
        .state()
        .set_registration_id("reg-1")
        .unwrap();

    Fixture {
        engine,
        backend,
        calls,
        clock,
        broadcaster,
    }
}

fn listener<T: Send + 'static>() -> (
    Option<courier_engine::ResultListener<T>>,
    oneshot::Receiver<SyncResult<T>>,
) {
    let (tx, rx) = oneshot::channel();
    (
        Some(Box::new(move |result| {
            let _ = tx.send(result);
        })),
        rx,
    )
}

fn transient() -> TransportError {
    TransportError::backend(500, "UNKNOWN_BACKEND_ERROR", "try later")
}

#[tokio::test(start_paused = true)]
async fn three_messages_succeed_after_quadratic_backoff() {
    let mut f = fixture(EngineConfig::default());
    f.backend.fail_next(transient());
    f.backend.fail_next(transient());
    let policy = RetryPolicy::builder()
        .with_max_retries(3)
        .with_backoff_multiplier(1)
        .build();

    let (done, result) = listener();
    f.engine.outgoing().send(
        vec![
            MoMessage::new("m1", "one", T0),
            MoMessage::new("m2", "two", T0),
            MoMessage::new("m3", "three", T0),
        ],
        Some(policy),
        done,
    );

    let mut attempts = Vec::new();
    for _ in 0..3 {
        match f.calls.recv().await {
            Some(BackendCall::SendMessages(request)) => assert_eq!(request.messages.len(), 3),
            other => panic!("unexpected call {other:?}"),
        }
        attempts.push(Instant::now());
    }
    assert_eq!(attempts[1] - attempts[0], Duration::from_secs(1));
    assert_eq!(attempts[2] - attempts[1], Duration::from_secs(4));

    let sent = result.await.unwrap().unwrap();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|m| m.status == MessageStatus::Sent));

    let sent_events = f
        .broadcaster
        .events()
        .into_iter()
        .filter(|event| matches!(event, BroadcastEvent::MessagesSent(_)))
        .count();
    assert_eq!(sent_events, 1);
    assert!(f.broadcaster.error_kinds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn n_failures_beyond_n_retries_report_one_terminal_error() {
    const N: u32 = 4;
    let f = fixture(EngineConfig::default());
    for _ in 0..=N {
        f.backend.fail_next(transient());
    }
    let policy = RetryPolicy::builder().with_max_retries(N).build();

    let (done, result) = listener();
    f.engine
        .outgoing()
        .send(vec![MoMessage::new("m1", "x", T0)], Some(policy), done);

    let err = result.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientBackend);
    assert_eq!(f.backend.call_count(), N as usize + 1);
    assert_eq!(f.broadcaster.error_kinds(), vec![ErrorKind::TransientBackend]);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(f.backend.call_count(), N as usize + 1);
}

#[tokio::test]
async fn invalid_parameter_is_never_retried() {
    let f = fixture(EngineConfig::default());
    f.backend.fail_next(TransportError::backend(
        400,
        "INVALID_PARAMETER",
        "bad destination",
    ));
    let policy = RetryPolicy::builder().with_max_retries(5).build();

    let (done, result) = listener();
    f.engine
        .outgoing()
        .send(vec![MoMessage::new("m1", "x", T0)], Some(policy), done);

    assert!(matches!(
        result.await.unwrap(),
        Err(SyncError::InvalidParameter { .. })
    ));
    assert_eq!(f.backend.call_count(), 1);
}

#[tokio::test]
async fn message_older_than_lifetime_is_dropped_not_sent() {
    let config = EngineConfig::default().with_outbox_lifetime(72 * HOUR);
    let f = fixture(config);
    let outgoing = f.engine.outgoing();

    let queued_at = T0 - (71 * HOUR).as_millis() as i64;
    outgoing
        .outbox()
        .enqueue(vec![
            MoMessage::new("stale", "x", queued_at),
            MoMessage::new("fresh", "y", T0),
        ])
        .unwrap();
    f.clock.advance(2 * HOUR);

    let (done, result) = listener();
    outgoing.sync(done);
    let sent = result.await.unwrap().unwrap();

    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_id, "fresh");
    match &f.backend.calls()[..] {
        [BackendCall::SendMessages(request)] => {
            assert_eq!(request.messages.len(), 1);
            assert_eq!(request.messages[0].message_id, "fresh");
        }
        other => panic!("unexpected calls {other:?}"),
    }
    assert!(outgoing.outbox().is_empty().unwrap());
}

#[tokio::test]
async fn already_expired_message_never_reaches_outbox() {
    let f = fixture(EngineConfig::default().with_outbox_lifetime(72 * HOUR));
    let outgoing = f.engine.outgoing();
    let created_at = T0 - (73 * HOUR).as_millis() as i64;

    outgoing
        .outbox()
        .enqueue(vec![MoMessage::new("old", "x", created_at)])
        .unwrap();
    assert!(outgoing.outbox().is_empty().unwrap());

    let (done, result) = listener();
    outgoing.sync(done);
    assert!(result.await.unwrap().unwrap().is_empty());
    assert_eq!(f.backend.call_count(), 0);
}

#[tokio::test]
async fn syncs_inside_throttle_window_make_one_call() {
    let f = fixture(EngineConfig::default().with_throttle_window(Duration::from_secs(1)));
    let outgoing = f.engine.outgoing();

    outgoing
        .outbox()
        .enqueue(vec![MoMessage::new("m1", "a", T0)])
        .unwrap();
    let (done, first) = listener();
    outgoing.sync(done);
    first.await.unwrap().unwrap();

    outgoing
        .outbox()
        .enqueue(vec![MoMessage::new("m2", "b", T0)])
        .unwrap();
    f.clock.advance(Duration::from_millis(400));
    let (done, second) = listener();
    outgoing.sync(done);
    assert!(second.await.unwrap().unwrap().is_empty());
    assert_eq!(f.backend.call_count(), 1);

    f.clock.advance(Duration::from_millis(600));
    let (done, third) = listener();
    outgoing.sync(done);
    let sent = third.await.unwrap().unwrap();
    assert_eq!(sent[0].message_id, "m2");
    assert_eq!(f.backend.call_count(), 2);
}

#[tokio::test]
async fn connectivity_trigger_flushes_every_queue() {
    let mut f = fixture(EngineConfig::default());
    f.engine.messages().report_delivery(["in-1"]).unwrap();
    f.engine
        .outgoing()
        .outbox()
        .enqueue(vec![MoMessage::new("out-1", "x", T0)])
        .unwrap();

    f.engine.on_connectivity_restored();

    let mut seen = Vec::new();
    for _ in 0..2 {
        match f.calls.recv().await {
            Some(BackendCall::SyncMessages(_)) => seen.push("sync"),
            Some(BackendCall::SendMessages(_)) => seen.push("send"),
            other => panic!("unexpected call {other:?}"),
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, vec!["send", "sync"]);
}
