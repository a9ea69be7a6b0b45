mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{client, config, observed_client, Recorder, PORT};
use fltport_client::{
    ClientConfig, ConnectionObserver, ConnectionState, DriverClient, ErrorKind, WorkerExit,
};
use fltport_transport::{loopback, LoopbackDriver, LoopbackEvent, LoopbackOp};
use fltport_wire::{decode_command, Command, DEFAULT_MAX_PAYLOAD};

use ConnectionState::*;

#[test]
fn connect_disconnect_visits_every_state() {
    let (client, _driver, recorder) = observed_client(2);
    assert_eq!(client.state(), Created);

    client.connect().expect("client should connect");
    assert_eq!(client.state(), Connected);
    client.disconnect().expect("client should disconnect");
    assert_eq!(client.state(), Closed);

    assert_eq!(
        recorder.transitions(),
        vec![
            (Created, Connecting),
            (Connecting, Connected),
            (Connected, Closing),
            (Closing, Closed),
        ]
    );
}

#[test]
fn closed_connection_reconnects() {
    let (client, driver, recorder) = observed_client(1);
    client.connect().expect("first connect should succeed");
    client.disconnect().expect("first disconnect should succeed");
    client.connect().expect("reconnect should succeed");
    client.disconnect().expect("second disconnect should succeed");

    let transitions = recorder.transitions();
    assert_eq!(transitions[4], (Closed, Connecting));
    assert_eq!(transitions.last(), Some(&(Closing, Closed)));
    assert_eq!(driver.stats().connects, 2);
    assert_eq!(driver.stats().open_ports, 0);
}

#[test]
fn connect_while_connected_is_conflict() {
    let (client, driver) = client(1);
    client.connect().expect("client should connect");

    let err = client.connect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(client.state(), Connected);
    assert_eq!(driver.stats().connects, 1);

    client.disconnect().expect("client should disconnect");
}

#[test]
fn execute_before_connect_is_conflict_without_transport_calls() {
    let (client, driver) = client(1);
    let err = client.execute(&Command::empty(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(client.state(), Created);
    assert_eq!(driver.stats().total_calls(), 0);
}

#[test]
fn execute_after_disconnect_is_conflict() {
    let (client, driver) = client(1);
    client.connect().expect("client should connect");
    client.disconnect().expect("client should disconnect");
    let before = driver.stats().total_calls();

    let err = client.execute(&Command::empty(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(driver.stats().total_calls(), before);
}

#[test]
fn disconnect_when_not_connected_is_conflict() {
    let (client, _driver) = client(1);
    let err = client.disconnect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(client.state(), Created);
}

#[test]
fn invalid_config_leaves_state_untouched() {
    let (transport, driver) = loopback(PORT);
    let client = DriverClient::new(transport, config(1).with_worker_count(0));
    let err = client.connect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(client.state(), Created);
    assert_eq!(driver.stats().total_calls(), 0);
}

#[test]
fn unknown_port_faults() {
    let (transport, _driver) = loopback(PORT);
    let client = DriverClient::new(transport, ClientConfig::new("\\Elsewhere").with_worker_count(1));
    let err = client.connect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(client.state(), Faulted);

    let err = client.connect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Faulted);
    client.release().expect("release is always permitted");
}

/// Checks, at every worker join, that neither handle has been closed yet.
struct JoinBeforeClose {
    driver: LoopbackDriver,
    violations: Mutex<usize>,
    joined: Mutex<Vec<WorkerExit>>,
}

impl ConnectionObserver for JoinBeforeClose {
    fn worker_exited(&self, _slot: usize, exit: &WorkerExit) {
        let stats = self.driver.stats();
        if stats.open_ports != 1 || stats.open_completions != 1 {
            *self.violations.lock().expect("observer lock") += 1;
        }
        self.joined.lock().expect("observer lock").push(exit.clone());
    }
}

#[test]
fn disconnect_joins_all_workers_before_closing_handles() {
    const WORKERS: usize = 4;
    let (transport, driver) = loopback(PORT);
    let observer = Arc::new(JoinBeforeClose {
        driver: driver.clone(),
        violations: Mutex::new(0),
        joined: Mutex::new(Vec::new()),
    });
    let client = DriverClient::with_observer(transport, config(WORKERS), observer.clone());

    client.connect().expect("client should connect");
    assert!(driver.wait_for(common::WAIT, |s| s.fetches >= WORKERS));
    client.disconnect().expect("client should disconnect");

    assert_eq!(*observer.violations.lock().unwrap(), 0);
    let joined = observer.joined.lock().unwrap().clone();
    assert_eq!(joined, vec![WorkerExit::Cancelled; WORKERS]);

    let journal = driver.journal();
    let completion_closed = journal
        .iter()
        .position(|e| *e == LoopbackEvent::CompletionClosed)
        .expect("completion handle should close");
    let port_closed = journal
        .iter()
        .position(|e| *e == LoopbackEvent::PortClosed)
        .expect("port should close");
    let cancels: Vec<usize> = journal
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, LoopbackEvent::FetchCancelled { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(cancels.len(), WORKERS);
    assert!(cancels.iter().all(|i| *i < completion_closed));
    assert!(completion_closed < port_closed);

    let stats = driver.stats();
    assert_eq!(stats.open_ports, 0);
    assert_eq!(stats.open_completions, 0);
}

#[test]
fn disconnect_observes_cancellation_within_poll_interval() {
    let (transport, driver) = loopback(PORT);
    let client = DriverClient::new(
        transport,
        config(2).with_poll_interval(Duration::from_millis(100)),
    );
    client.connect().expect("client should connect");
    assert!(driver.wait_for(common::WAIT, |s| s.fetches >= 2));

    let started = Instant::now();
    client.disconnect().expect("client should disconnect");
    assert!(
        started.elapsed() < Duration::from_millis(100 * 5),
        "disconnect took {:?}",
        started.elapsed()
    );
}

#[test]
fn worker_count_matches_completion_concurrency() {
    let (client, driver) = client(3);
    client.connect().expect("client should connect");
    assert!(driver.wait_for(common::WAIT, |s| s.fetches >= 3));
    assert!(driver
        .journal()
        .contains(&LoopbackEvent::CompletionBound { concurrency: 3 }));
    client.disconnect().expect("client should disconnect");
}

#[test]
fn command_roundtrip_boundary_payloads() {
    let (client, driver) = client(1);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    driver.set_command_handler(move |raw| {
        let command = decode_command(raw, DEFAULT_MAX_PAYLOAD).map_err(|_| -1)?;
        sink.lock().unwrap().push(command.clone());
        Ok((command.payload.len() as u32).to_le_bytes().to_vec())
    });
    client.connect().expect("client should connect");

    let max = vec![0x5A; DEFAULT_MAX_PAYLOAD];
    for payload in [&b""[..], &b"x"[..], &max[..]] {
        let command = Command::new(9, payload.to_vec());
        let len: u32 = client
            .execute_typed(&command)
            .expect("command should round-trip");
        assert_eq!(len as usize, payload.len());
    }

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), 3);
    assert!(received.iter().all(|c| c.type_code == 9));
    assert_eq!(received[2].payload.len(), DEFAULT_MAX_PAYLOAD);

    client.disconnect().expect("client should disconnect");
}

#[test]
fn execute_raw_returns_exact_bytes() {
    let (client, driver) = client(1);
    driver.set_command_handler(|_| Ok(b"status-block".to_vec()));
    client.connect().expect("client should connect");

    let bytes = client
        .execute_raw(&Command::empty(2), 12)
        .expect("raw command should succeed");
    assert_eq!(&bytes[..], b"status-block");
    client.disconnect().expect("client should disconnect");
}

#[test]
fn send_failure_faults_connection() {
    let (client, driver, recorder) = observed_client(2);
    client.connect().expect("client should connect");
    driver.fail_next(LoopbackOp::Send, 0xC000_0001_u32 as i32);

    let err = client.execute(&Command::empty(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(err.status(), Some(0xC000_0001_u32 as i32));
    assert_eq!(client.state(), Faulted);

    let tail: Vec<_> = recorder.transitions().into_iter().skip(2).collect();
    assert_eq!(tail, vec![(Connected, Closing), (Closing, Faulted)]);

    let stats = driver.stats();
    assert_eq!(stats.open_ports, 0);
    assert_eq!(stats.open_completions, 0);

    for err in [
        client.execute(&Command::empty(1)).unwrap_err(),
        client.connect().unwrap_err(),
        client.disconnect().unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::Faulted);
    }
    client.release().expect("release is always permitted");
}

#[test]
fn response_size_mismatch_is_protocol_error() {
    let (client, driver) = client(1);
    driver.set_command_handler(|_| Ok(vec![1, 2]));
    client.connect().expect("client should connect");

    let err = client.execute_typed::<u32>(&Command::empty(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(client.state(), Faulted);
}

#[test]
fn failed_connect_keeps_handles_until_release() {
    let (client, driver) = client(2);
    driver.fail_next(LoopbackOp::BindCompletion, 0xC000_009A_u32 as i32);

    let err = client.connect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(client.state(), Faulted);
    assert_eq!(driver.stats().open_ports, 1);

    client.release().expect("release should close leftover handles");
    assert_eq!(driver.stats().open_ports, 0);
    assert_eq!(client.state(), Faulted);
}

#[test]
fn drop_releases_handles() {
    let (client, driver) = client(2);
    driver.fail_next(LoopbackOp::BindCompletion, -1);
    assert!(client.connect().is_err());
    drop(client);
    assert_eq!(driver.stats().open_ports, 0);

    let (client, driver) = common::client(2);
    client.connect().expect("client should connect");
    assert!(driver.wait_for(common::WAIT, |s| s.fetches >= 2));
    drop(client);
    let stats = driver.stats();
    assert_eq!(stats.open_ports, 0);
    assert_eq!(stats.open_completions, 0);
    assert_eq!(stats.cancels, 2);
}

#[test]
fn register_handler_while_connected_is_conflict() {
    let (client, _driver) = client(1);
    client.connect().expect("client should connect");
    let err = client
        .register_handler(1, |_: &fltport_wire::Notification<'_>| -> fltport_client::HandlerResult { Ok(None) })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    client.disconnect().expect("client should disconnect");

    client
        .register_handler(1, |_: &fltport_wire::Notification<'_>| -> fltport_client::HandlerResult { Ok(None) })
        .expect("registration is allowed once closed");
}

#[test]
fn recorder_sees_worker_exits() {
    let (client, _driver, recorder): (_, _, Arc<Recorder>) = observed_client(2);
    client.connect().expect("client should connect");
    client.disconnect().expect("client should disconnect");
    let mut slots: Vec<usize> = recorder.exits().into_iter().map(|(slot, _)| slot).collect();
    slots.sort_unstable();
    assert_eq!(slots, vec![0, 1]);
}
