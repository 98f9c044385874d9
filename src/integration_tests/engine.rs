use super::broker::{Behavior, FakeBroker, CHANNEL_MAX, FRAME_MAX};
use crate::errors::*;
use crate::{
    Connection, ConnectionOptions, ConsumerOptions, ListenerRestartHook, QueueDeclareOptions,
};
use crossbeam_channel::unbounded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const PATIENCE: Duration = Duration::from_secs(5);

fn options() -> ConnectionOptions {
    ConnectionOptions::default()
        .connection_timeout(PATIENCE)
        .rpc_timeout(PATIENCE)
        .retry_wait(Duration::from_millis(100))
        .consumer_threads(2)
}

fn start_with(broker: &FakeBroker, options: ConnectionOptions) -> Connection {
    let connection = Connection::new();
    connection
        .init("guest", "guest", broker.address(), None, options)
        .unwrap();
    connection.start().unwrap();
    connection
}

fn start(broker: &FakeBroker) -> Connection {
    start_with(broker, options())
}

fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn start_negotiates_and_close_is_idempotent() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start(&broker);
    assert!(connection.is_open());

    let tuning = connection.negotiated().unwrap();
    assert_eq!(tuning.channel_max, CHANNEL_MAX);
    assert_eq!(tuning.frame_max, FRAME_MAX);
    assert_eq!(tuning.heartbeat, 0);

    match connection.start().unwrap_err() {
        Error::AlreadyStarted => (),
        err => panic!("unexpected error {}", err),
    }

    connection.close().unwrap();
    assert!(!connection.is_open());
    connection.close().unwrap();
    assert!(broker.wait_for(0, "connection.close", PATIENCE));
}

#[test]
fn channel_numbers_are_never_reused() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start(&broker);

    let channels: Vec<_> = (0..3).map(|_| connection.create_channel().unwrap()).collect();
    let ids: Vec<_> = channels.iter().map(|ch| ch.channel_id()).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    connection.close_channel(&channels[1]).unwrap();
    assert!(!channels[1].is_open());
    assert!(broker.wait_for(2, "channel.close", PATIENCE));
    assert_eq!(connection.open_channel_count(), 2);

    let next = connection.create_channel().unwrap();
    assert_eq!(next.channel_id(), 4);
    assert_eq!(connection.open_channel_count(), 3);

    connection.close().unwrap();
}

#[test]
fn silent_broker_times_out() {
    let broker = FakeBroker::start(Behavior::Silent);
    let connection = Connection::new();
    let options = options().connection_timeout(Duration::from_millis(50));
    connection
        .init("guest", "guest", broker.address(), None, options)
        .unwrap();

    let started = Instant::now();
    let err = connection.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
    match err {
        Error::ConnectionTimeout { timeout, .. } => {
            assert_eq!(timeout, Duration::from_millis(50))
        }
        err => panic!("unexpected error {}", err),
    }
    // the I/O thread has been joined by the time start() returns
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "{:?}", elapsed);
    assert!(!connection.is_open());
    connection.close().unwrap();
}

#[test]
fn refused_login_fails_start() {
    let broker = FakeBroker::start(Behavior::RefuseLogin);
    let connection = Connection::new();
    connection
        .init("guest", "wrong", broker.address(), None, options())
        .unwrap();
    match connection.start().unwrap_err() {
        Error::LoginRefused { code, .. } => assert_eq!(code, 403),
        err => panic!("unexpected error {}", err),
    }
    assert!(!connection.is_open());
    connection.close().unwrap();
}

#[test]
fn server_closed_channel_leaves_others_alone() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start(&broker);
    let one = connection.create_channel().unwrap();
    let two = connection.create_channel().unwrap();

    broker.close_channel(2, 404, "NOT_FOUND - no queue 'missing'");
    assert!(eventually(|| connection.open_channel_count() == 1));
    assert!(broker.wait_for(2, "channel.close-ok", PATIENCE));

    let err = two.basic_qos(0, 10, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    match &*two.close_reason().unwrap() {
        Error::ServerClosedChannel { code, .. } => assert_eq!(*code, 404),
        err => panic!("unexpected reason {}", err),
    }

    one.basic_qos(0, 10, false).unwrap();
    connection.close().unwrap();
}

#[test]
fn receive_times_out_with_none() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start(&broker);
    let channel = connection.create_channel().unwrap();

    let started = Instant::now();
    assert!(channel.receive(Duration::from_millis(100)).unwrap().is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));

    connection.close().unwrap();
}

#[test]
fn publish_then_get() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start(&broker);
    let channel = connection.create_channel().unwrap();

    let declared = channel
        .queue_declare("jobs", false, QueueDeclareOptions::default())
        .unwrap()
        .unwrap();
    assert_eq!(declared.name, "jobs");
    assert_eq!(declared.message_count, 0);

    channel
        .basic_publish("hello", "", "jobs", false, false, &Default::default())
        .unwrap();
    let get = channel.basic_get("jobs", false).unwrap().unwrap();
    assert_eq!(get.delivery.content(), b"hello");
    assert_eq!(get.delivery.routing_key(), "jobs");
    assert_eq!(get.message_count, 0);
    get.ack(&channel, false).unwrap();
    assert!(broker.wait_for(1, "basic.ack", PATIENCE));

    assert!(channel.basic_get("jobs", false).unwrap().is_none());
    assert_eq!(channel.queue_purge("jobs", false).unwrap(), Some(0));

    connection.close().unwrap();
}

#[test]
fn late_reply_is_never_matched_to_a_later_request() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start_with(&broker, options().rpc_timeout(Duration::from_millis(100)));
    let slow = connection.create_channel().unwrap();
    let getter = connection.create_channel().unwrap();
    let healthy = connection.create_channel().unwrap();

    broker.hold_replies(slow.channel_id());
    match slow
        .queue_declare("a", false, QueueDeclareOptions::default())
        .unwrap_err()
    {
        Error::RpcTimeout { channel_id } => assert_eq!(channel_id, slow.channel_id()),
        err => panic!("unexpected error {}", err),
    }
    broker.release_replies(slow.channel_id());
    assert!(broker.wait_for(slow.channel_id(), "queue.declare", PATIENCE));

    // the declare-ok for "a" is on its way and must not answer this request
    match slow
        .queue_declare("b", false, QueueDeclareOptions::default())
        .unwrap_err()
    {
        Error::ChannelClosed { channel_id } => assert_eq!(channel_id, slow.channel_id()),
        err => panic!("unexpected error {}", err),
    }

    broker.hold_replies(getter.channel_id());
    match getter.basic_get("a", false).unwrap_err() {
        Error::RpcTimeout { channel_id } => assert_eq!(channel_id, getter.channel_id()),
        err => panic!("unexpected error {}", err),
    }
    broker.release_replies(getter.channel_id());
    assert!(broker.wait_for(getter.channel_id(), "basic.get", PATIENCE));
    match getter.basic_get("a", false).unwrap_err() {
        Error::ChannelClosed { .. } => (),
        err => panic!("unexpected error {}", err),
    }

    let declared = healthy
        .queue_declare("b", false, QueueDeclareOptions::default())
        .unwrap()
        .unwrap();
    assert_eq!(declared.name, "b");

    // a channel that gave up on a reply can still be closed
    slow.close().unwrap();
    assert!(broker.wait_for(slow.channel_id(), "channel.close", PATIENCE));
    assert_eq!(connection.open_channel_count(), 2);

    connection.close().unwrap();
}

#[test]
fn large_message_spans_frames() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start_with(&broker, options().frame_max(4096));
    let channel = connection.create_channel().unwrap();

    let body: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    channel
        .basic_publish(&body, "", "big", false, false, &Default::default())
        .unwrap();
    let get = channel.basic_get("big", true).unwrap().unwrap();
    assert_eq!(get.delivery.content(), &body[..]);

    connection.close().unwrap();
}

#[test]
fn consumer_sees_deliveries_in_order() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start(&broker);
    let channel = connection.create_channel().unwrap();

    let tag = channel
        .basic_consume("work", "", ConsumerOptions::default())
        .unwrap();
    assert_eq!(tag, "amq.ctag-1");

    for body in &["a", "b", "c"] {
        channel
            .basic_publish(body, "", "work", false, false, &Default::default())
            .unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..3 {
        let delivery = channel.next_delivery(PATIENCE).unwrap().unwrap();
        assert_eq!(delivery.consumer_tag(), "amq.ctag-1");
        seen.push(String::from_utf8(delivery.into_content()).unwrap());
    }
    assert_eq!(seen, vec!["a", "b", "c"]);

    channel.basic_cancel(&tag, false).unwrap();
    connection.close().unwrap();
}

#[test]
fn interleaved_deliveries_stay_on_their_channel() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start(&broker);
    let one = connection.create_channel().unwrap();
    let two = connection.create_channel().unwrap();

    for i in 0..5u64 {
        broker.deliver(1, "one", i + 1, format!("one-{}", i).as_bytes());
        broker.deliver(2, "two", i + 1, format!("two-{}", i).as_bytes());
    }

    let reader = {
        let two = two.clone();
        thread::spawn(move || {
            (0..5)
                .map(|_| {
                    let delivery = two.next_delivery(PATIENCE).unwrap().unwrap();
                    String::from_utf8(delivery.into_content()).unwrap()
                })
                .collect::<Vec<_>>()
        })
    };
    let from_one: Vec<_> = (0..5)
        .map(|_| {
            let delivery = one.next_delivery(PATIENCE).unwrap().unwrap();
            assert_eq!(delivery.channel_id(), 1);
            String::from_utf8(delivery.into_content()).unwrap()
        })
        .collect();
    let from_two = reader.join().unwrap();

    let expected = |prefix: &str| (0..5).map(|i| format!("{}-{}", prefix, i)).collect::<Vec<_>>();
    assert_eq!(from_one, expected("one"));
    assert_eq!(from_two, expected("two"));

    connection.close().unwrap();
}

#[test]
fn connection_loss_is_reported_once() {
    let broker = FakeBroker::start(Behavior::Normal);
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let hook = {
        let reasons = Arc::clone(&reasons);
        ListenerRestartHook::new(move |reason: &str| {
            reasons.lock().unwrap().push(reason.to_string())
        })
    };
    let connection = start_with(&broker, options().restart_hook(hook));
    let channel = connection.create_channel().unwrap();

    broker.hangup();
    assert!(eventually(|| !connection.is_open()));
    assert!(eventually(|| !channel.is_open()));
    match &*channel.close_reason().unwrap() {
        Error::IoInterrupted { .. } => (),
        err => panic!("unexpected reason {}", err),
    }

    match channel.basic_qos(0, 1, false).unwrap_err() {
        Error::ChannelClosed { channel_id } => assert_eq!(channel_id, 1),
        err => panic!("unexpected error {}", err),
    }
    match connection.create_channel().unwrap_err() {
        Error::ConnectionClosed => (),
        err => panic!("unexpected error {}", err),
    }
    assert_eq!(reasons.lock().unwrap().len(), 1);

    connection.close().unwrap();
    assert_eq!(reasons.lock().unwrap().len(), 1);
}

#[test]
fn server_close_is_reported_to_channels() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start(&broker);
    let channel = connection.create_channel().unwrap();

    broker.close_connection(320, "CONNECTION_FORCED - broker forced connection closure");
    assert!(eventually(|| !channel.is_open()));
    match &*channel.close_reason().unwrap() {
        Error::ServerClosedConnection { code, .. } => assert_eq!(*code, 320),
        err => panic!("unexpected reason {}", err),
    }
    assert!(broker.wait_for(0, "connection.close-ok", PATIENCE));
    assert!(!connection.is_open());

    connection.close().unwrap();
}

#[test]
fn close_drains_every_channel() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start(&broker);
    let channels: Vec<_> = (0..3).map(|_| connection.create_channel().unwrap()).collect();
    assert_eq!(connection.open_channel_count(), 3);

    connection.close().unwrap();
    assert_eq!(connection.open_channel_count(), 0);
    for channel in &channels {
        match &*channel.close_reason().unwrap() {
            Error::ClientClosedConnection => (),
            err => panic!("unexpected reason {}", err),
        }
    }
}

#[test]
fn dispatch_runs_until_close() {
    let broker = FakeBroker::start(Behavior::Normal);
    let connection = start(&broker);

    let ran = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = unbounded();
    for _ in 0..4 {
        let ran = Arc::clone(&ran);
        let tx = tx.clone();
        connection
            .dispatch(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            })
            .unwrap();
    }
    for _ in 0..4 {
        rx.recv_timeout(PATIENCE).unwrap();
    }
    assert_eq!(ran.load(Ordering::SeqCst), 4);

    connection.close().unwrap();
    match connection.dispatch(|| ()).unwrap_err() {
        Error::ConnectionClosed => (),
        err => panic!("unexpected error {}", err),
    }
}
