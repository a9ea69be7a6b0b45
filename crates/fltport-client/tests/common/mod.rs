#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use fltport_client::{
    ClientConfig, ConnectionObserver, ConnectionState, DriverClient, WorkerExit,
};
use fltport_transport::{loopback, LoopbackDriver, LoopbackTransport};
use fltport_wire::encode_notification;

pub const PORT: &str = "\\FltportTestPort";
pub const WAIT: Duration = Duration::from_secs(5);

pub fn config(workers: usize) -> ClientConfig {
    ClientConfig::new(PORT)
        .with_worker_count(workers)
        .with_poll_interval(Duration::from_millis(20))
}

pub fn client(workers: usize) -> (DriverClient<LoopbackTransport>, LoopbackDriver) {
    let (transport, driver) = loopback(PORT);
    (DriverClient::new(transport, config(workers)), driver)
}

pub fn observed_client(
    workers: usize,
) -> (DriverClient<LoopbackTransport>, LoopbackDriver, Arc<Recorder>) {
    let (transport, driver) = loopback(PORT);
    let recorder = Arc::new(Recorder::default());
    let client = DriverClient::with_observer(transport, config(workers), recorder.clone());
    (client, driver, recorder)
}

pub fn notification(message_id: i32, type_code: i32, payload: &[u8], capacity: usize) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_notification(message_id, type_code, payload, capacity, &mut buf)
        .expect("notification should encode");
    buf.to_vec()
}

pub fn wait_for_state(
    client: &DriverClient<LoopbackTransport>,
    state: ConnectionState,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if client.state() == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    client.state() == state
}

/// Records every callback in order.
#[derive(Default)]
pub struct Recorder {
    pub transitions: Mutex<Vec<(ConnectionState, ConnectionState)>>,
    pub exits: Mutex<Vec<(usize, WorkerExit)>>,
}

impl Recorder {
    pub fn transitions(&self) -> Vec<(ConnectionState, ConnectionState)> {
        self.transitions.lock().expect("recorder lock").clone()
    }

    pub fn exits(&self) -> Vec<(usize, WorkerExit)> {
        self.exits.lock().expect("recorder lock").clone()
    }
}

impl ConnectionObserver for Recorder {
    fn state_changed(&self, from: ConnectionState, to: ConnectionState) {
        self.transitions
            .lock()
            .expect("recorder lock")
            .push((from, to));
    }

    fn worker_exited(&self, slot: usize, exit: &WorkerExit) {
        self.exits
            .lock()
            .expect("recorder lock")
            .push((slot, exit.clone()));
    }
}
