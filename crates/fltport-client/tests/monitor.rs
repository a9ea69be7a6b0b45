mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{client, notification, wait_for_state, WAIT};
use fltport_client::{ConnectionState, ErrorKind, HandlerError, HandlerResult};
use fltport_transport::LoopbackOp;
use fltport_wire::{decode_reply, Command, Notification, STATUS_UNSUCCESSFUL};

fn echo(n: &Notification<'_>) -> HandlerResult {
    Ok(Some(Bytes::copy_from_slice(n.payload())))
}

#[test]
fn twelve_byte_reply_round_trip() {
    let (client, driver) = client(1);
    client
        .register_handler(7, |n: &Notification<'_>| -> HandlerResult {
            assert_eq!(n.payload(), b"C:\\a.txt");
            Ok(Some(Bytes::from_static(&[1, 2, 3, 4])))
        })
        .expect("handler should register");
    client.connect().expect("client should connect");

    let key = driver.push_message(notification(42, 7, b"C:\\a.txt", 12));
    let reply = driver.next_reply(WAIT).expect("a reply should arrive");
    assert_eq!(reply.message_key, key);
    assert_eq!(reply.bytes.len(), 12);

    let (header, body) = decode_reply(&reply.bytes).expect("reply should decode");
    assert_eq!(header.message_id, 42);
    assert_eq!(header.status, 0);
    assert_eq!(&body.payload[..], &[1, 2, 3, 4]);

    assert_eq!(client.state(), ConnectionState::Connected);
    client.disconnect().expect("client should disconnect");
}

#[test]
fn zero_capacity_sends_no_reply() {
    let (client, driver) = client(1);
    client.register_handler(1, echo).expect("handler should register");
    client.connect().expect("client should connect");

    driver.push_message(notification(1, 1, b"dropped", 0));
    // Same worker, so the first message is fully handled before this one.
    driver.push_message(notification(2, 1, b"", 8));

    let reply = driver.next_reply(WAIT).expect("second message should be answered");
    let (header, _) = decode_reply(&reply.bytes).expect("reply should decode");
    assert_eq!(header.message_id, 2);
    assert_eq!(driver.stats().replies, 1);
    assert_eq!(client.state(), ConnectionState::Connected);

    client.disconnect().expect("client should disconnect");
}

#[test]
fn handler_failure_replies_with_status() {
    let (client, driver) = client(1);
    client
        .register_handler(3, |_: &Notification<'_>| -> HandlerResult {
            Err(HandlerError::new(0xC000_0022_u32 as i32, "access denied"))
        })
        .expect("handler should register");
    client.connect().expect("client should connect");

    driver.push_message(notification(5, 3, b"x", 64));
    let reply = driver.next_reply(WAIT).expect("a reply should arrive");
    let (header, body) = decode_reply(&reply.bytes).expect("reply should decode");
    assert_eq!(header.status, 0xC000_0022_u32 as i32);
    assert!(body.payload.is_empty());
    assert_eq!(client.state(), ConnectionState::Connected);

    client.disconnect().expect("client should disconnect");
}

#[test]
fn handler_panic_replies_with_status() {
    let (client, driver) = client(1);
    client
        .register_handler(3, |_: &Notification<'_>| -> HandlerResult {
            panic!("handler bug")
        })
        .expect("handler should register");
    client.connect().expect("client should connect");

    driver.push_message(notification(6, 3, b"", 8));
    let reply = driver.next_reply(WAIT).expect("a reply should arrive");
    let (header, _) = decode_reply(&reply.bytes).expect("reply should decode");
    assert_eq!(header.status, STATUS_UNSUCCESSFUL);
    assert_eq!(client.state(), ConnectionState::Connected);

    client.disconnect().expect("client should disconnect");
}

#[test]
fn oversized_reply_faults_without_sending() {
    let (client, driver) = client(1);
    client
        .register_handler(1, |_: &Notification<'_>| -> HandlerResult {
            Ok(Some(Bytes::from(vec![0u8; 10])))
        })
        .expect("handler should register");
    client.connect().expect("client should connect");

    driver.push_message(notification(1, 1, b"", 12));
    assert!(wait_for_state(&client, ConnectionState::Faulted, WAIT));
    assert_eq!(driver.stats().replies, 0);
    assert_eq!(driver.stats().open_ports, 0);

    let err = client.execute(&Command::empty(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Faulted);
}

#[test]
fn unregistered_type_faults_without_reply() {
    let (client, driver) = client(1);
    client.register_handler(1, echo).expect("handler should register");
    client.connect().expect("client should connect");

    driver.push_message(notification(1, 99, b"?", 16));
    assert!(wait_for_state(&client, ConnectionState::Faulted, WAIT));
    assert_eq!(driver.stats().replies, 0);
    assert!(driver.take_replies().is_empty());
}

#[test]
fn oversized_notification_faults() {
    let (transport, driver) = fltport_transport::loopback(common::PORT);
    let client = fltport_client::DriverClient::new(
        transport,
        common::config(1).with_max_notification_payload(8),
    );
    client.register_handler(1, echo).expect("handler should register");
    client.connect().expect("client should connect");

    driver.push_message(notification(1, 1, &[0u8; 32], 64));
    assert!(wait_for_state(&client, ConnectionState::Faulted, WAIT));
    assert_eq!(driver.stats().replies, 0);
}

#[test]
fn fetch_failure_faults() {
    let (client, driver) = client(1);
    driver.fail_next(LoopbackOp::GetMessage, 0xC000_0001_u32 as i32);
    client.connect().expect("connect itself should succeed");
    assert!(wait_for_state(&client, ConnectionState::Faulted, WAIT));
    let stats = driver.stats();
    assert_eq!(stats.open_ports, 0);
    assert_eq!(stats.open_completions, 0);
}

#[test]
fn reply_failure_faults() {
    let (client, driver) = client(1);
    client.register_handler(1, echo).expect("handler should register");
    driver.fail_next(LoopbackOp::Reply, -1);
    client.connect().expect("client should connect");

    driver.push_message(notification(1, 1, b"", 8));
    assert!(wait_for_state(&client, ConnectionState::Faulted, WAIT));
}

#[test]
fn many_workers_answer_every_notification() {
    const MESSAGES: i32 = 64;
    let (client, driver) = client(4);
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    client
        .register_handler(2, move |n: &Notification<'_>| -> HandlerResult {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Bytes::copy_from_slice(n.payload())))
        })
        .expect("handler should register");
    client.connect().expect("client should connect");

    for id in 0..MESSAGES {
        driver.push_message(notification(id, 2, &id.to_le_bytes(), 12));
    }

    let mut seen = BTreeSet::new();
    for _ in 0..MESSAGES {
        let reply = driver.next_reply(WAIT).expect("every message should be answered");
        let (header, body) = decode_reply(&reply.bytes).expect("reply should decode");
        assert_eq!(&body.payload[..], &header.message_id.to_le_bytes());
        seen.insert(header.message_id);
    }
    assert_eq!(seen.len(), MESSAGES as usize);
    assert_eq!(handled.load(Ordering::SeqCst), MESSAGES as usize);

    client.disconnect().expect("client should disconnect");
    assert!(driver.next_reply(Duration::from_millis(50)).is_none());
}
