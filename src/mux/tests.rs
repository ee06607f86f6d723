use super::*;
use crate::broker::MockBroker;
use std::time::Duration;

const TOPIC: &str = "home.smoker-1.temperature";

fn settings(mailbox_capacity: usize) -> MuxSettings {
    MuxSettings {
        address: "mock://broker".to_string(),
        retry: RetryPolicy {
            sequence: BackoffSequence::Fibonacci,
            base_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(20),
            max_retries: 3,
            attempt_timeout: Duration::from_secs(1),
        },
        mailbox_capacity,
        event_buffer: 64,
    }
}

fn start(mock: &Arc<MockBroker>, mailbox_capacity: usize) -> Multiplexer {
    Multiplexer::start(mock.clone(), settings(mailbox_capacity))
}

/// Poll `cond` until it holds or two seconds pass.
async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll the topic's stats until `cond` holds for the first entry.
async fn wait_for_stats(mux: &Multiplexer, what: &str, cond: impl Fn(&TopicStats) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if mux.stats().await.first().is_some_and(&cond) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn recv_text(session: &mut ClientSession) -> String {
    let msg = tokio::time::timeout(Duration::from_secs(2), session.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("session ended");
    String::from_utf8(msg.payload.to_vec()).unwrap()
}

async fn assert_nothing_queued(session: &mut ClientSession) {
    let next = tokio::time::timeout(Duration::from_millis(50), session.recv()).await;
    assert!(next.is_err(), "unexpected message: {next:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_subscribes_share_one_broker_subscription() {
    let mock = Arc::new(MockBroker::new());
    mock.set_subscribe_delay(Duration::from_millis(50));
    let mux = Arc::new(start(&mock, 8));
    wait_until("connection", || mux.status() == ConnectionState::Connected).await;

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.subscribe(TOPIC) })
        })
        .collect();
    let mut sessions = Vec::new();
    for handle in handles {
        sessions.push(handle.await.unwrap().unwrap());
    }

    wait_until("route", || mock.has_route(TOPIC)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.subscribe_count(TOPIC), 1);
    assert_eq!(mux.registry().len(), 1);

    let stats = mux.stats().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].clients, 20);

    assert!(mock.publish(TOPIC, "72"));
    for session in &mut sessions {
        assert_eq!(recv_text(session).await, "72");
    }
}

#[tokio::test]
async fn test_full_mailbox_drops_only_the_overflow() {
    let mock = Arc::new(MockBroker::new());
    let mux = start(&mock, 2);
    let mut session = mux.subscribe(TOPIC).unwrap();
    wait_until("route", || mock.has_route(TOPIC)).await;

    for payload in ["1", "2", "3"] {
        assert!(mock.publish(TOPIC, payload));
    }
    wait_until("drop", || session.dropped() == 1).await;

    assert_eq!(recv_text(&mut session).await, "1");
    assert_eq!(recv_text(&mut session).await, "2");
    assert_nothing_queued(&mut session).await;

    let stats = mux.stats().await;
    assert_eq!(stats[0].delivered, 2);
    assert_eq!(stats[0].dropped, 1);
}

#[tokio::test]
async fn test_slow_session_does_not_hold_back_others() {
    let mock = Arc::new(MockBroker::new());
    let mux = start(&mock, 1);
    let slow = mux.subscribe(TOPIC).unwrap();
    let mut fast = mux.subscribe(TOPIC).unwrap();
    wait_until("route", || mock.has_route(TOPIC)).await;

    for payload in ["a", "b", "c"] {
        assert!(mock.publish(TOPIC, payload));
        assert_eq!(recv_text(&mut fast).await, payload);
    }
    wait_until("drops", || slow.dropped() == 2).await;
}

#[tokio::test]
async fn test_last_close_tears_down_topic() {
    let mock = Arc::new(MockBroker::new());
    let mux = start(&mock, 4);
    let first = mux.subscribe(TOPIC).unwrap();
    let second = mux.subscribe(TOPIC).unwrap();
    wait_until("route", || mock.has_route(TOPIC)).await;

    first.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.unsubscribe_count(TOPIC), 0);
    assert!(mux.registry().contains(TOPIC));

    drop(second);
    wait_until("teardown", || !mux.registry().contains(TOPIC)).await;
    assert_eq!(mock.unsubscribe_count(TOPIC), 1);
    assert!(!mock.has_route(TOPIC));
}

#[tokio::test]
async fn test_topic_is_recreated_after_teardown() {
    let mock = Arc::new(MockBroker::new());
    let mux = start(&mock, 4);

    let session = mux.subscribe(TOPIC).unwrap();
    wait_until("route", || mock.has_route(TOPIC)).await;
    session.close();
    wait_until("teardown", || !mux.registry().contains(TOPIC)).await;

    let mut session = mux.subscribe(TOPIC).unwrap();
    wait_until("route", || mock.has_route(TOPIC)).await;
    assert_eq!(mock.subscribe_count(TOPIC), 2);
    assert!(mock.publish(TOPIC, "again"));
    assert_eq!(recv_text(&mut session).await, "again");
}

#[tokio::test]
async fn test_reconnect_resumes_delivery() {
    let mock = Arc::new(MockBroker::new());
    let mux = start(&mock, 8);
    let mut session = mux.subscribe(TOPIC).unwrap();
    wait_until("route", || mock.has_route(TOPIC)).await;

    assert!(mock.publish(TOPIC, "before"));
    assert_eq!(recv_text(&mut session).await, "before");

    mock.hold_connects(true);
    mock.drop_connection();
    wait_until("disconnect", || mux.status() != ConnectionState::Connected).await;

    assert!(!mock.publish(TOPIC, "lost"));
    assert_nothing_queued(&mut session).await;
    assert_eq!(mock.subscribe_count(TOPIC), 1);
    wait_for_stats(&mux, "suspension", |s| {
        s.state == SubscriptionState::Suspended && s.clients == 1
    })
    .await;

    mock.hold_connects(false);
    wait_until("resubscribe", || mock.has_route(TOPIC)).await;
    assert_eq!(mock.subscribe_count(TOPIC), 2);
    assert_eq!(mock.connect_count(), 2);

    assert!(mock.publish(TOPIC, "after"));
    assert_eq!(recv_text(&mut session).await, "after");
}

#[tokio::test]
async fn test_fan_out_preserves_order_per_session() {
    let mock = Arc::new(MockBroker::new());
    let mux = start(&mock, 16);
    let mut sessions: Vec<ClientSession> =
        (0..3).map(|_| mux.subscribe(TOPIC).unwrap()).collect();
    wait_until("route", || mock.has_route(TOPIC)).await;

    let sent: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
    for payload in &sent {
        assert!(mock.publish(TOPIC, payload.clone()));
    }

    for session in &mut sessions {
        let mut received = Vec::new();
        for _ in 0..sent.len() {
            received.push(recv_text(session).await);
        }
        assert_eq!(received, sent);
    }
}

#[tokio::test]
async fn test_double_close_removes_session_once() {
    let mock = Arc::new(MockBroker::new());
    let mux = start(&mock, 4);
    let first = mux.subscribe(TOPIC).unwrap();
    let mut second = mux.subscribe(TOPIC).unwrap();
    wait_until("route", || mock.has_route(TOPIC)).await;

    first.close();
    first.close();
    drop(first);

    wait_for_stats(&mux, "client removal", |s| s.clients == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(mux.stats().await[0].clients, 1);
    assert_eq!(mock.unsubscribe_count(TOPIC), 0);

    assert!(mock.publish(TOPIC, "still here"));
    assert_eq!(recv_text(&mut second).await, "still here");
}

#[tokio::test]
async fn test_sessions_only_see_their_topic() {
    let mock = Arc::new(MockBroker::new());
    let mux = start(&mock, 4);
    let mut temps = mux.subscribe(TOPIC).unwrap();
    let mut fans = mux.subscribe("home.smoker-1.fan").unwrap();
    wait_until("routes", || {
        mock.has_route(TOPIC) && mock.has_route("home.smoker-1.fan")
    })
    .await;

    assert!(mock.publish("home.smoker-1.fan", "on"));
    assert_eq!(recv_text(&mut fans).await, "on");
    assert_nothing_queued(&mut temps).await;
}

#[tokio::test]
async fn test_subscribe_before_connect_delivers_once_connected() {
    let mock = Arc::new(MockBroker::new());
    mock.hold_connects(true);
    let mux = start(&mock, 4);

    let mut session = mux.subscribe(TOPIC).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(mock.subscribe_count(TOPIC), 0);

    mock.hold_connects(false);
    wait_until("route", || mock.has_route(TOPIC)).await;
    assert!(mock.publish(TOPIC, "hello"));
    assert_eq!(recv_text(&mut session).await, "hello");
    assert_eq!(mock.subscribe_count(TOPIC), 1);
}

#[tokio::test]
async fn test_subscribe_failure_ends_sessions_and_allows_retry() {
    let mock = Arc::new(MockBroker::new());
    mock.reject_topic(TOPIC);
    let mux = start(&mock, 4);

    let mut session = mux.subscribe(TOPIC).unwrap();
    let ended = tokio::time::timeout(Duration::from_secs(2), session.recv())
        .await
        .unwrap();
    assert!(ended.is_none());
    assert!(matches!(
        session.error(),
        Some(MuxError::SubscribeFailed { topic, .. }) if topic == TOPIC
    ));
    wait_until("eviction", || !mux.registry().contains(TOPIC)).await;

    mock.allow_topic(TOPIC);
    let mut retry = mux.subscribe(TOPIC).unwrap();
    wait_until("route", || mock.has_route(TOPIC)).await;
    assert_eq!(mock.subscribe_count(TOPIC), 2);
    assert!(mock.publish(TOPIC, "ok"));
    assert_eq!(recv_text(&mut retry).await, "ok");
}

#[tokio::test]
async fn test_retry_exhaustion_is_fatal() {
    let mock = Arc::new(MockBroker::new());
    mock.fail_next_connects(100);
    let mux = start(&mock, 4);

    let err = tokio::time::timeout(Duration::from_secs(2), mux.closed())
        .await
        .unwrap();
    match err {
        MuxError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 4);
            assert!(matches!(last, BrokerError::Connect(_)));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(mock.connect_count(), 4);
    assert_eq!(mux.status(), ConnectionState::Failed);
    assert!(matches!(
        mux.subscribe(TOPIC),
        Err(MuxError::RetriesExhausted { .. })
    ));
}

#[tokio::test]
async fn test_connect_recovers_within_retry_budget() {
    let mock = Arc::new(MockBroker::new());
    mock.fail_next_connects(2);
    let mux = start(&mock, 4);

    wait_until("connection", || mux.status() == ConnectionState::Connected).await;
    assert_eq!(mock.connect_count(), 3);
}

#[tokio::test]
async fn test_shutdown_ends_sessions_and_unsubscribes() {
    let mock = Arc::new(MockBroker::new());
    let mux = start(&mock, 4);
    let mut session = mux.subscribe(TOPIC).unwrap();
    wait_until("route", || mock.has_route(TOPIC)).await;

    mux.shutdown().await;

    assert!(session.recv().await.is_none());
    assert!(matches!(session.error(), Some(MuxError::ShuttingDown)));
    assert_eq!(mock.unsubscribe_count(TOPIC), 1);
    assert!(mux.registry().is_empty());
    assert_eq!(mux.status(), ConnectionState::ShuttingDown);
    assert!(matches!(mux.subscribe(TOPIC), Err(MuxError::ShuttingDown)));

    // Second call is a no-op.
    mux.shutdown().await;
}

#[tokio::test]
async fn test_empty_topic_is_rejected() {
    let mock = Arc::new(MockBroker::new());
    let mux = start(&mock, 4);
    assert!(matches!(mux.subscribe(""), Err(MuxError::InvalidTopic(_))));
    assert!(mux.registry().is_empty());
}

#[tokio::test]
async fn test_join_during_teardown_after_reconnect_subscribes_once_per_link() {
    let mock = Arc::new(MockBroker::new());
    mock.set_subscribe_delay(Duration::from_millis(200));
    let mux = start(&mock, 4);

    let first = mux.subscribe(TOPIC).unwrap();
    wait_until("route", || mock.has_route(TOPIC)).await;

    // Link 2: the subscription is now busy in a slow subscribe.
    mock.drop_connection();
    wait_until("subscribe on link 2", || mock.subscribe_count(TOPIC) == 2).await;

    // Link 3 is published while the actor is still busy on link 2.
    mock.drop_connection();
    wait_until("link 3", || mock.connect_count() == 3).await;

    // Last client leaves and a new one joins before the actor wakes up.
    first.close();
    let mut second = mux.subscribe(TOPIC).unwrap();

    wait_until("route on link 3", || mock.has_route(TOPIC)).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(mock.subscribe_count(TOPIC), 3);

    assert!(mock.publish(TOPIC, "kept"));
    assert_eq!(recv_text(&mut second).await, "kept");
    assert!(second.error().is_none());
}
