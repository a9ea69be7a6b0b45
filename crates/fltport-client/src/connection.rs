//! Connection lifecycle state machine.
//!
//! Every transition happens while holding the exclusivity lock. The current
//! state is mirrored into an atomic so it can be read without the lock, for
//! instance to discover an asynchronous fault while idle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use bytes::{Bytes, BytesMut};
use fltport_transport::{Buffer, CommunicationPort, CompletionPort, FilterTransport};
use fltport_wire::{encode_command, Command, WireError, COMMAND_HEADER_SIZE};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::handler::{HandlerRegistry, NotificationHandler};
use crate::monitor::{MonitorWorker, WorkerExit};
use crate::state::{ConnectionObserver, ConnectionState};

struct WorkerHandle {
    slot: usize,
    thread: JoinHandle<Result<()>>,
}

struct Inner<T: FilterTransport> {
    port: Option<Arc<T::Port>>,
    completion: Option<Arc<T::Completion>>,
    workers: Vec<WorkerHandle>,
    cancel: CancellationToken,
    handlers: Arc<HandlerRegistry>,
    // Incremented per connect so a late worker fault cannot tear down a
    // later cycle.
    epoch: u64,
}

struct Core<T: FilterTransport> {
    transport: T,
    config: ClientConfig,
    state: AtomicU8,
    inner: Mutex<Inner<T>>,
    observer: Option<Arc<dyn ConnectionObserver>>,
}

/// A duplex channel to a kernel extension plus its monitor workers.
///
/// Dropping the connection disconnects it and releases every handle.
pub struct Connection<T: FilterTransport> {
    core: Arc<Core<T>>,
}

impl<T: FilterTransport> Connection<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self::build(transport, config, None)
    }

    /// Create a connection reporting to `observer`.
    pub fn with_observer(
        transport: T,
        config: ClientConfig,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        Self::build(transport, config, Some(observer))
    }

    fn build(
        transport: T,
        config: ClientConfig,
        observer: Option<Arc<dyn ConnectionObserver>>,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                transport,
                config,
                state: AtomicU8::new(ConnectionState::Created as u8),
                inner: Mutex::new(Inner {
                    port: None,
                    completion: None,
                    workers: Vec::new(),
                    cancel: CancellationToken::new(),
                    handlers: Arc::new(HandlerRegistry::new()),
                    epoch: 0,
                }),
                observer,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    pub fn transport(&self) -> &T {
        &self.core.transport
    }

    /// Open the port, bind the completion handle and start the workers.
    pub fn connect(&self) -> Result<()> {
        Core::connect(&self.core)
    }

    /// Stop the workers and close both handles.
    pub fn disconnect(&self) -> Result<()> {
        self.core.disconnect()
    }

    /// Send `command` and return exactly `response_size` response bytes.
    ///
    /// Any failure tears the connection down into `Faulted`.
    pub fn send_command(&self, command: &Command, response_size: usize) -> Result<Bytes> {
        self.core.send_command(command, response_size)
    }

    /// Register the handler for `type_code`. Only while no workers run.
    pub fn register_handler<H: NotificationHandler>(&self, type_code: i32, handler: H) -> Result<()> {
        self.core.register_handler(type_code, handler)
    }

    /// Disconnect if connected, then close any leftover handles.
    /// Permitted from every state.
    pub fn release(&self) -> Result<()> {
        self.core.release()
    }
}

impl<T: FilterTransport> Drop for Connection<T> {
    fn drop(&mut self) {
        if let Err(err) = self.core.release() {
            warn!(%err, "failed to release connection on drop");
        }
    }
}

impl<T: FilterTransport> Core<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    // Takes the guard to prove the lock is held.
    fn transition(&self, _inner: &mut Inner<T>, to: ConnectionState) {
        let from = self.state();
        self.state.store(to as u8, Ordering::Release);
        debug!(port = %self.config.port_name, %from, %to, "connection state changed");
        if let Some(observer) = &self.observer {
            observer.state_changed(from, to);
        }
    }

    fn require_connected(&self, op: &'static str) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Faulted => Err(ClientError::Faulted),
            state => Err(ClientError::Conflict { op, state }),
        }
    }

    fn connect(self: &Arc<Self>) -> Result<()> {
        self.config.validate()?;
        let mut inner = self.lock();
        match self.state() {
            ConnectionState::Faulted => return Err(ClientError::Faulted),
            state if !state.can_connect() => {
                return Err(ClientError::Conflict {
                    op: "connect",
                    state,
                })
            }
            _ => {}
        }

        self.transition(&mut inner, ConnectionState::Connecting);
        match self.open(&mut inner) {
            Ok(()) => {
                self.transition(&mut inner, ConnectionState::Connected);
                debug!(
                    port = %self.config.port_name,
                    transport = self.transport.transport_name(),
                    workers = inner.workers.len(),
                    "connected"
                );
                Ok(())
            }
            Err(err) => {
                error!(port = %self.config.port_name, %err, "connect failed");
                inner.cancel.cancel();
                if let Some(exit) = self.join_workers(&mut inner) {
                    debug!(%exit, "worker stopped abnormally during failed connect");
                }
                self.transition(&mut inner, ConnectionState::Faulted);
                Err(err)
            }
        }
    }

    fn open(self: &Arc<Self>, inner: &mut Inner<T>) -> Result<()> {
        let workers = self.config.worker_count;
        let port = Arc::new(self.transport.connect(&self.config.port_name)?);
        inner.port = Some(Arc::clone(&port));
        let completion = Arc::new(self.transport.bind_completion(&port, workers)?);
        inner.completion = Some(Arc::clone(&completion));

        inner.cancel = CancellationToken::new();
        inner.epoch += 1;
        let epoch = inner.epoch;

        for slot in 0..workers {
            let worker = MonitorWorker::new(
                slot,
                Arc::clone(&port),
                Arc::clone(&completion),
                Arc::clone(&inner.handlers),
                inner.cancel.clone(),
                &self.config,
            );
            let core = Arc::downgrade(self);
            let thread = thread::Builder::new()
                .name(format!("fltport-monitor-{slot}"))
                .spawn(move || {
                    let result = worker.run();
                    if let Err(err) = &result {
                        error!(slot, %err, "monitor worker faulted");
                        Core::report_fault(core, epoch);
                    }
                    result
                })
                .map_err(|source| ClientError::Spawn { slot, source })?;
            inner.workers.push(WorkerHandle { slot, thread });
        }
        Ok(())
    }

    /// Hand a worker fault to a short-lived supervisor thread.
    ///
    /// The worker must not take the lock itself: `disconnect` holds it while
    /// joining the workers.
    fn report_fault(core: Weak<Self>, epoch: u64) {
        let spawned = thread::Builder::new()
            .name("fltport-supervisor".into())
            .spawn(move || {
                if let Some(core) = core.upgrade() {
                    core.fault_from_worker(epoch);
                }
            });
        if let Err(err) = spawned {
            error!(%err, "failed to spawn fault supervisor");
        }
    }

    fn fault_from_worker(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch != epoch || self.state() != ConnectionState::Connected {
            return;
        }
        warn!(port = %self.config.port_name, "tearing down after worker fault");
        self.force_teardown(&mut inner);
    }

    /// `Connected → Closing → Faulted`, releasing everything on the way.
    fn force_teardown(&self, inner: &mut Inner<T>) {
        self.transition(inner, ConnectionState::Closing);
        if let Err(err) = self.teardown(inner) {
            warn!(%err, "teardown after fault failed");
        }
        self.transition(inner, ConnectionState::Faulted);
    }

    /// Join every worker and report how each ended. Returns the first
    /// abnormal exit as an error.
    fn join_workers(&self, inner: &mut Inner<T>) -> Option<ClientError> {
        let mut first = None;
        for handle in inner.workers.drain(..) {
            let slot = handle.slot;
            let exit = match handle.thread.join() {
                Ok(Ok(())) => WorkerExit::Cancelled,
                Ok(Err(err)) => {
                    let reason = err.to_string();
                    first.get_or_insert(ClientError::WorkerFaulted {
                        slot,
                        reason: reason.clone(),
                    });
                    WorkerExit::Faulted(reason)
                }
                Err(_) => {
                    first.get_or_insert(ClientError::WorkerPanicked { slot });
                    WorkerExit::Panicked
                }
            };
            debug!(slot, %exit, "monitor worker joined");
            if let Some(observer) = &self.observer {
                observer.worker_exited(slot, &exit);
            }
        }
        first
    }

    /// Close the completion handle, then the port.
    fn close_handles(&self, inner: &mut Inner<T>) -> Result<()> {
        let mut first = None;
        if let Some(completion) = inner.completion.take() {
            if let Err(err) = completion.close() {
                first.get_or_insert(ClientError::from(err));
            }
        }
        if let Some(port) = inner.port.take() {
            if let Err(err) = port.close() {
                first.get_or_insert(ClientError::from(err));
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Cancel, join barrier, close handles.
    fn teardown(&self, inner: &mut Inner<T>) -> Result<()> {
        inner.cancel.cancel();
        let joined = self.join_workers(inner);
        let closed = self.close_handles(inner);
        match joined {
            Some(err) => Err(err),
            None => closed,
        }
    }

    fn disconnect(&self) -> Result<()> {
        let mut inner = self.lock();
        self.require_connected("disconnect")?;
        self.transition(&mut inner, ConnectionState::Closing);
        match self.teardown(&mut inner) {
            Ok(()) => {
                self.transition(&mut inner, ConnectionState::Closed);
                debug!(port = %self.config.port_name, "disconnected");
                Ok(())
            }
            Err(err) => {
                error!(port = %self.config.port_name, %err, "disconnect failed");
                self.transition(&mut inner, ConnectionState::Faulted);
                Err(err)
            }
        }
    }

    fn send_command(&self, command: &Command, response_size: usize) -> Result<Bytes> {
        if command.payload.len() > i32::MAX as usize - COMMAND_HEADER_SIZE {
            return Err(ClientError::Validation(format!(
                "command payload of {} bytes exceeds the wire limit",
                command.payload.len()
            )));
        }
        if response_size > i32::MAX as usize {
            return Err(ClientError::Validation(format!(
                "response size {response_size} exceeds the wire limit"
            )));
        }
        let mut inner = self.lock();
        self.require_connected("execute a command")?;
        let Some(port) = inner.port.clone() else {
            return Err(ClientError::Faulted);
        };

        let result = Self::round_trip(port.as_ref(), command, response_size);
        if let Err(err) = &result {
            error!(
                port = %self.config.port_name,
                type_code = command.type_code,
                %err,
                "command failed; tearing down"
            );
            self.force_teardown(&mut inner);
        }
        result
    }

    fn round_trip(port: &T::Port, command: &Command, response_size: usize) -> Result<Bytes> {
        let mut request = BytesMut::with_capacity(command.wire_size());
        encode_command(command, &mut request)?;

        let mut response = Buffer::with_capacity(response_size);
        let written = port.send_message(&request, response.storage_mut())?;
        if written != response_size {
            return Err(WireError::ResponseSize {
                expected: response_size,
                actual: written,
            }
            .into());
        }
        response.set_len(written);
        Ok(Bytes::copy_from_slice(response.as_slice()))
    }

    fn register_handler<H: NotificationHandler>(&self, type_code: i32, handler: H) -> Result<()> {
        let mut inner = self.lock();
        match self.state() {
            ConnectionState::Created | ConnectionState::Closed => {}
            ConnectionState::Faulted => return Err(ClientError::Faulted),
            state => {
                return Err(ClientError::Conflict {
                    op: "register a handler",
                    state,
                })
            }
        }
        let Some(registry) = Arc::get_mut(&mut inner.handlers) else {
            return Err(ClientError::Conflict {
                op: "register a handler",
                state: self.state(),
            });
        };
        if registry.register(type_code, handler) {
            debug!(type_code, "notification handler replaced");
        }
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let mut inner = self.lock();
        let mut result = Ok(());
        if self.state() == ConnectionState::Connected {
            self.transition(&mut inner, ConnectionState::Closing);
            result = self.teardown(&mut inner);
            let to = if result.is_ok() {
                ConnectionState::Closed
            } else {
                ConnectionState::Faulted
            };
            self.transition(&mut inner, to);
        }
        if inner.port.is_some() || inner.completion.is_some() {
            debug!(port = %self.config.port_name, "releasing leftover handles");
            let closed = self.close_handles(&mut inner);
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }
}
