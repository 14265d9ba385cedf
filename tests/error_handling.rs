//! Error handling and edge case tests.

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tributary::{
    handler, Client, ClientConfig, ClientError, LocalBroker, Message, MessageOptions,
    Subscription, SubscriptionOptions, SubscriptionState,
};

/// Route the client's logs into the test harness output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn test_client(config: ClientConfig) -> (Arc<LocalBroker>, Client) {
    init_tracing();
    let broker = Arc::new(LocalBroker::default());
    let client = Client::with_config(broker.clone(), config).unwrap();
    client.create_stream("orders").unwrap();
    (broker, client)
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        poll_interval_ms: 10,
        resume_backoff_ms: 10,
        ..Default::default()
    }
}

fn publish_n(client: &Client, range: std::ops::Range<u64>) {
    let opts = MessageOptions::builder()
        .ack_deadline(Duration::from_secs(1))
        .build()
        .unwrap();
    for i in range {
        client.publish("orders", i.to_be_bytes().to_vec(), &opts).unwrap();
    }
}

fn subscribe_collecting(
    client: &Client,
    options: &SubscriptionOptions,
) -> tributary::Result<(Subscription, Receiver<Message>, Receiver<ClientError>)> {
    let (msg_tx, msg_rx) = unbounded();
    let (err_tx, err_rx) = unbounded();
    let sub = client.subscribe(
        "orders",
        options,
        handler(
            move |msg| {
                let _ = msg_tx.send(msg);
            },
            move |err| {
                let _ = err_tx.send(err);
            },
        ),
    )?;
    Ok((sub, msg_rx, err_rx))
}

fn collect_offsets(rx: &Receiver<Message>, count: usize) -> Vec<u64> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut out = Vec::new();
    while out.len() < count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(msg) => out.push(msg.offset()),
            Err(_) => break,
        }
    }
    out
}

fn earliest() -> SubscriptionOptions {
    SubscriptionOptions::builder().start_at_earliest().build().unwrap()
}

// --- Setup Errors ---

#[test]
fn test_subscribe_nonexistent_stream() {
    let (_broker, client) = test_client(fast_config());
    let called = Arc::new(AtomicUsize::new(0));
    let on_msg = Arc::clone(&called);
    let on_err = Arc::clone(&called);

    let result = client.subscribe(
        "foo",
        &SubscriptionOptions::default(),
        handler(
            move |_| {
                on_msg.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                on_err.fetch_add(1, Ordering::SeqCst);
            },
        ),
    );

    assert!(matches!(
        result,
        Err(ClientError::NoSuchPartition { ref stream, partition: 0 }) if stream == "foo"
    ));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert_eq!(client.active_subscriptions(), 0);
}

#[test]
fn test_subscribe_nonexistent_partition() {
    let (_broker, client) = test_client(fast_config());
    let opts = SubscriptionOptions::builder().partition(3).build().unwrap();

    let result = subscribe_collecting(&client, &opts);
    assert!(matches!(
        result,
        Err(ClientError::NoSuchPartition { partition: 3, .. })
    ));
}

#[test]
fn test_subscribe_offset_below_log_start() {
    let (broker, client) = test_client(fast_config());
    publish_n(&client, 0..5);
    broker.truncate_before("orders", 0, 3).unwrap();

    let opts = SubscriptionOptions::builder().start_at_offset(1).build().unwrap();
    let result = subscribe_collecting(&client, &opts);
    assert!(matches!(
        result,
        Err(ClientError::OffsetOutOfRange { requested: 1, .. })
    ));

    // The retained window is still readable
    let opts = SubscriptionOptions::builder().start_at_offset(3).build().unwrap();
    let (sub, msgs, _errors) = subscribe_collecting(&client, &opts).unwrap();
    assert_eq!(collect_offsets(&msgs, 2), vec![3, 4]);
    sub.unsubscribe().unwrap();
}

#[test]
fn test_subscribe_invalid_stream_name() {
    let (_broker, client) = test_client(fast_config());
    let result = client.subscribe("", &SubscriptionOptions::default(), handler(|_| {}, |_| {}));
    assert!(matches!(result, Err(ClientError::InvalidArgument(_))));
}

// --- Streaming Errors ---

#[test]
fn test_stream_deleted_mid_subscription() {
    let (_broker, client) = test_client(fast_config());
    let (sub, msgs, errors) = subscribe_collecting(&client, &earliest()).unwrap();

    publish_n(&client, 0..3);
    assert_eq!(collect_offsets(&msgs, 3), vec![0, 1, 2]);

    client.delete_stream("orders").unwrap();

    let err = errors.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(
        err,
        ClientError::NoSuchPartition { ref stream, partition: 0 } if stream == "orders"
    ));
    assert_eq!(sub.state(), SubscriptionState::Failed);

    // Exactly one error, nothing after it
    assert!(errors.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(msgs.try_recv().is_err());
}

#[test]
fn test_corrupt_frame_fails_subscription() {
    let (broker, client) = test_client(fast_config());
    publish_n(&client, 0..2);
    broker.append_raw("orders", 0, b"garbage".to_vec()).unwrap();
    publish_n(&client, 3..4);

    let (sub, msgs, errors) = subscribe_collecting(&client, &earliest()).unwrap();

    // Messages before the corrupt frame still arrive, in order
    assert_eq!(collect_offsets(&msgs, 2), vec![0, 1]);
    let err = errors.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(err, ClientError::DecodeFailure(_)));
    assert!(errors.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(msgs.try_recv().is_err());
    assert_eq!(sub.state(), SubscriptionState::Failed);
}

#[test]
fn test_retention_overtakes_slow_reader() {
    let config = ClientConfig {
        delivery_queue_depth: 1,
        ..fast_config()
    };
    let (broker, client) = test_client(config);
    publish_n(&client, 0..10);

    let (release_tx, release_rx) = unbounded::<()>();
    let (msg_tx, msg_rx) = unbounded();
    let (err_tx, err_rx) = unbounded();
    let sub = client
        .subscribe(
            "orders",
            &earliest(),
            handler(
                move |msg: Message| {
                    let _ = release_rx.recv();
                    let _ = msg_tx.send(msg);
                },
                move |err| {
                    let _ = err_tx.send(err);
                },
            ),
        )
        .unwrap();

    // Handler is parked and the queue is full, so the read loop stalls
    thread::sleep(Duration::from_millis(100));
    broker.truncate_before("orders", 0, 10).unwrap();
    drop(release_tx);

    let err = err_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(err, ClientError::OffsetOutOfRange { .. }));

    // Whatever was read before the truncation arrives as a gap-free prefix
    let offsets: Vec<u64> = msg_rx.try_iter().map(|m| m.offset()).collect();
    assert_eq!(offsets, (0..offsets.len() as u64).collect::<Vec<u64>>());
    assert!(offsets.len() < 10);
    assert_eq!(sub.state(), SubscriptionState::Failed);
}

#[test]
fn test_transport_drop_without_resume_fails() {
    let (broker, client) = test_client(fast_config());
    let (sub, msgs, errors) = subscribe_collecting(&client, &earliest()).unwrap();
    publish_n(&client, 0..2);
    assert_eq!(collect_offsets(&msgs, 2), vec![0, 1]);

    broker.disconnect_readers("orders", 0).unwrap();

    let err = errors.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(err, ClientError::TransportFailure(_)));
    assert_eq!(sub.state(), SubscriptionState::Failed);
}

#[test]
fn test_transport_drop_resumes_without_gaps() {
    let (broker, client) = test_client(fast_config());
    publish_n(&client, 0..5);

    let opts = SubscriptionOptions::builder()
        .start_at_earliest()
        .resume_attempts(3)
        .build()
        .unwrap();
    let (sub, msgs, errors) = subscribe_collecting(&client, &opts).unwrap();
    assert_eq!(collect_offsets(&msgs, 5), vec![0, 1, 2, 3, 4]);

    broker.disconnect_readers("orders", 0).unwrap();
    publish_n(&client, 5..10);

    // Picks up right after the last offset read: no gaps, no duplicates
    assert_eq!(collect_offsets(&msgs, 5), vec![5, 6, 7, 8, 9]);
    assert!(msgs.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(errors.try_recv().is_err());
    assert_eq!(sub.state(), SubscriptionState::Active);

    // Each successful read refills the attempt budget
    for offset in 10..15 {
        broker.disconnect_readers("orders", 0).unwrap();
        publish_n(&client, offset..offset + 1);
        assert_eq!(collect_offsets(&msgs, 1), vec![offset]);
    }
    assert_eq!(sub.state(), SubscriptionState::Active);

    sub.unsubscribe().unwrap();
}

// --- Handler Behavior ---

#[test]
fn test_unsubscribe_from_inside_handler() {
    let (_broker, client) = test_client(fast_config());
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let (tx, rx) = unbounded();

    let handler_slot = Arc::clone(&slot);
    let sub = client
        .subscribe(
            "orders",
            &SubscriptionOptions::default(),
            handler(
                move |msg: Message| {
                    if let Some(sub) = handler_slot.lock().as_ref() {
                        sub.unsubscribe().unwrap();
                    }
                    let _ = tx.send(msg.offset());
                },
                |_| {},
            ),
        )
        .unwrap();
    *slot.lock() = Some(sub.clone());

    publish_n(&client, 0..5);

    // The callback that unsubscribed is the last one
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(sub.state(), SubscriptionState::Closed);
}

#[test]
fn test_unsubscribe_after_failure_is_noop() {
    let (_broker, client) = test_client(fast_config());
    let (sub, _msgs, errors) = subscribe_collecting(&client, &earliest()).unwrap();

    client.delete_stream("orders").unwrap();
    errors.recv_timeout(Duration::from_secs(5)).unwrap();

    sub.unsubscribe().unwrap();
    assert_eq!(sub.state(), SubscriptionState::Failed);
}

#[test]
fn test_unsubscribe_waits_for_running_error_callback() {
    let (_broker, client) = test_client(fast_config());
    let (started_tx, started_rx) = unbounded();
    let finished = Arc::new(AtomicUsize::new(0));
    let on_err = Arc::clone(&finished);

    let sub = client
        .subscribe(
            "orders",
            &earliest(),
            handler(
                |_| {},
                move |_| {
                    let _ = started_tx.send(());
                    thread::sleep(Duration::from_millis(100));
                    on_err.fetch_add(1, Ordering::SeqCst);
                },
            ),
        )
        .unwrap();

    client.delete_stream("orders").unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Already failed, but still blocks until `on_error` returns
    sub.unsubscribe().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(sub.state(), SubscriptionState::Failed);
}

#[test]
fn test_slow_handler_with_small_queue() {
    let config = ClientConfig {
        delivery_queue_depth: 1,
        ..fast_config()
    };
    let (_broker, client) = test_client(config);
    publish_n(&client, 0..20);

    let (tx, rx) = unbounded();
    let sub = client
        .subscribe(
            "orders",
            &earliest(),
            handler(
                move |msg: Message| {
                    thread::sleep(Duration::from_millis(2));
                    let _ = tx.send(msg);
                },
                |_| {},
            ),
        )
        .unwrap();

    assert_eq!(collect_offsets(&rx, 20), (0..20).collect::<Vec<u64>>());
    assert_eq!(sub.last_offset(), Some(19));
    sub.unsubscribe().unwrap();
}

#[test]
fn test_handler_panic_fails_subscription() {
    let (_broker, client) = test_client(fast_config());
    let (err_tx, err_rx) = unbounded::<ClientError>();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);

    let sub = client
        .subscribe(
            "orders",
            &earliest(),
            handler(
                move |msg: Message| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if msg.offset() == 1 {
                        panic!("handler bug");
                    }
                },
                move |err| {
                    let _ = err_tx.send(err);
                },
            ),
        )
        .unwrap();

    publish_n(&client, 0..5);

    // The panic surfaces as exactly one typed error
    let err = err_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(
        err,
        ClientError::HandlerPanicked(ref reason) if reason.contains("handler bug")
    ));
    assert_eq!(sub.state(), SubscriptionState::Failed);
    assert!(err_rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    // Other subscriptions on the same client are unaffected
    let (other, msgs, _errors) = subscribe_collecting(&client, &earliest()).unwrap();
    assert_eq!(collect_offsets(&msgs, 5).len(), 5);
    other.unsubscribe().unwrap();
}
