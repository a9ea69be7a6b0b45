//! In-process filter port.
//!
//! [`loopback`] returns a connected pair: a [`LoopbackTransport`] that the
//! client side uses exactly like the filter manager backend, and a
//! [`LoopbackDriver`] that plays the kernel extension. The driver queues
//! messages, collects replies, answers commands, injects one-shot failures,
//! and keeps call counters plus a journal of handle lifetime events so
//! ordering and leak properties can be asserted.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::manager::{FilterInfo, FilterManager};
use crate::traits::{
    CommunicationPort, CompletionPort, FetchRequest, FetchState, FilterTransport, WaitStatus,
};

type CommandHandler = Box<dyn FnMut(&[u8]) -> std::result::Result<Vec<u8>, i32> + Send>;

/// Operations that can be made to fail once via [`LoopbackDriver::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopbackOp {
    Connect,
    BindCompletion,
    Send,
    GetMessage,
    Wait,
    Reply,
    Cancel,
    ClosePort,
    CloseCompletion,
}

impl LoopbackOp {
    fn name(self) -> &'static str {
        match self {
            LoopbackOp::Connect => "connect",
            LoopbackOp::BindCompletion => "bind_completion",
            LoopbackOp::Send => "send_message",
            LoopbackOp::GetMessage => "get_message",
            LoopbackOp::Wait => "wait",
            LoopbackOp::Reply => "reply_message",
            LoopbackOp::Cancel => "cancel_io",
            LoopbackOp::ClosePort => "close_port",
            LoopbackOp::CloseCompletion => "close_completion",
        }
    }
}

/// Handle lifetime and traffic events, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackEvent {
    PortOpened,
    CompletionBound { concurrency: usize },
    CommandSent { len: usize },
    FetchPosted { token: u64 },
    MessageDelivered { message_key: u64 },
    ReplySent { message_key: u64, len: usize },
    FetchCancelled { token: u64 },
    CompletionClosed,
    PortClosed,
}

/// Call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub connects: usize,
    pub binds: usize,
    pub sends: usize,
    pub fetches: usize,
    pub deliveries: usize,
    pub replies: usize,
    pub cancels: usize,
    pub open_ports: usize,
    pub open_completions: usize,
}

impl LoopbackStats {
    /// Total calls that crossed the client/extension boundary.
    pub fn total_calls(&self) -> usize {
        self.connects + self.binds + self.sends + self.fetches + self.replies + self.cancels
    }
}

/// A reply received by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackReply {
    pub message_key: u64,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<(u64, Vec<u8>)>,
    replies: VecDeque<LoopbackReply>,
    failures: HashMap<LoopbackOp, i32>,
    stats: LoopbackStats,
    journal: Vec<LoopbackEvent>,
    next_message_key: u64,
    next_token: u64,
}

impl State {
    fn take_failure(&mut self, op: LoopbackOp) -> Result<()> {
        match self.failures.remove(&op) {
            Some(status) => Err(TransportError::Native {
                op: op.name(),
                status,
            }),
            None => Ok(()),
        }
    }
}

struct Shared {
    port_name: String,
    state: Mutex<State>,
    messages: Condvar,
    replies: Condvar,
    command_handler: Mutex<Option<CommandHandler>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a connected transport/driver pair serving `port_name`.
pub fn loopback(port_name: &str) -> (LoopbackTransport, LoopbackDriver) {
    let shared = Arc::new(Shared {
        port_name: port_name.to_string(),
        state: Mutex::new(State {
            next_message_key: 1,
            next_token: 1,
            ..State::default()
        }),
        messages: Condvar::new(),
        replies: Condvar::new(),
        command_handler: Mutex::new(None),
    });
    (
        LoopbackTransport {
            shared: Arc::clone(&shared),
        },
        LoopbackDriver { shared },
    )
}

/// Client side of a loopback pair.
#[derive(Clone)]
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl FilterTransport for LoopbackTransport {
    type Port = LoopbackPort;
    type Completion = LoopbackCompletion;

    fn connect(&self, port_name: &str) -> Result<LoopbackPort> {
        let mut state = self.shared.lock();
        state.take_failure(LoopbackOp::Connect)?;
        if port_name != self.shared.port_name {
            return Err(TransportError::Connect {
                name: port_name.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such loopback port"),
            });
        }
        state.stats.connects += 1;
        state.stats.open_ports += 1;
        state.journal.push(LoopbackEvent::PortOpened);
        debug!(port = port_name, "loopback port opened");
        Ok(LoopbackPort {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        })
    }

    fn bind_completion(&self, port: &LoopbackPort, concurrency: usize) -> Result<LoopbackCompletion> {
        if port.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut state = self.shared.lock();
        state.take_failure(LoopbackOp::BindCompletion)?;
        state.stats.binds += 1;
        state.stats.open_completions += 1;
        state
            .journal
            .push(LoopbackEvent::CompletionBound { concurrency });
        Ok(LoopbackCompletion {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        })
    }

    fn transport_name(&self) -> &'static str {
        "loopback"
    }
}

/// Loopback communication port.
pub struct LoopbackPort {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl LoopbackPort {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut state = self.shared.lock();
        state.stats.open_ports -= 1;
        state.journal.push(LoopbackEvent::PortClosed);
        drop(state);
        self.shared.messages.notify_all();
        true
    }
}

impl CommunicationPort for LoopbackPort {
    fn send_message(&self, command: &[u8], response: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        {
            let mut state = self.shared.lock();
            state.take_failure(LoopbackOp::Send)?;
            state.stats.sends += 1;
            state
                .journal
                .push(LoopbackEvent::CommandSent { len: command.len() });
        }

        let mut handler = self
            .shared
            .command_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(handler) = handler.as_mut() else {
            return Ok(0);
        };
        let answer = handler(command).map_err(|status| TransportError::Native {
            op: "send_message",
            status,
        })?;
        if answer.len() > response.len() {
            return Err(TransportError::MessageTooLarge {
                size: answer.len(),
                capacity: response.len(),
            });
        }
        response[..answer.len()].copy_from_slice(&answer);
        Ok(answer.len())
    }

    fn get_message(&self, request: &mut FetchRequest) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        state.take_failure(LoopbackOp::GetMessage)?;
        let token = state.next_token;
        request.begin(token)?;
        state.next_token += 1;
        state.stats.fetches += 1;
        state.journal.push(LoopbackEvent::FetchPosted { token });
        trace!(token, "loopback fetch posted");
        Ok(())
    }

    fn reply_message(&self, request: &FetchRequest, reply: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if request.state() != FetchState::Completed {
            return Err(TransportError::RequestState {
                op: "reply",
                state: request.state(),
            });
        }
        let mut state = self.shared.lock();
        state.take_failure(LoopbackOp::Reply)?;
        state.stats.replies += 1;
        state.journal.push(LoopbackEvent::ReplySent {
            message_key: request.message_key(),
            len: reply.len(),
        });
        state.replies.push_back(LoopbackReply {
            message_key: request.message_key(),
            bytes: reply.to_vec(),
        });
        drop(state);
        self.shared.replies.notify_all();
        Ok(())
    }

    fn cancel_io(&self, request: &mut FetchRequest) -> Result<()> {
        if !request.is_pending() {
            return Ok(());
        }
        let mut state = self.shared.lock();
        state.take_failure(LoopbackOp::Cancel)?;
        state.stats.cancels += 1;
        state.journal.push(LoopbackEvent::FetchCancelled {
            token: request.token(),
        });
        request.abandon();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.lock().take_failure(LoopbackOp::ClosePort)?;
        self.release();
        Ok(())
    }
}

impl Drop for LoopbackPort {
    fn drop(&mut self) {
        if self.release() {
            debug!("loopback port released on drop");
        }
    }
}

/// Loopback completion-delivery handle.
pub struct LoopbackCompletion {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl LoopbackCompletion {
    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut state = self.shared.lock();
        state.stats.open_completions -= 1;
        state.journal.push(LoopbackEvent::CompletionClosed);
        drop(state);
        self.shared.messages.notify_all();
        true
    }
}

impl CompletionPort for LoopbackCompletion {
    fn wait(&self, request: &mut FetchRequest, timeout: Duration) -> Result<WaitStatus> {
        if !request.is_pending() {
            return Err(TransportError::RequestState {
                op: "wait",
                state: request.state(),
            });
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        state.take_failure(LoopbackOp::Wait)?;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            if let Some((message_key, bytes)) = state.queue.pop_front() {
                request.complete(message_key, &bytes)?;
                state.stats.deliveries += 1;
                state
                    .journal
                    .push(LoopbackEvent::MessageDelivered { message_key });
                return Ok(WaitStatus::Completed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitStatus::TimedOut);
            }
            state = self
                .shared
                .messages
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.shared
            .lock()
            .take_failure(LoopbackOp::CloseCompletion)?;
        self.release();
        Ok(())
    }
}

impl Drop for LoopbackCompletion {
    fn drop(&mut self) {
        if self.release() {
            debug!("loopback completion handle released on drop");
        }
    }
}

/// Kernel side of a loopback pair.
#[derive(Clone)]
pub struct LoopbackDriver {
    shared: Arc<Shared>,
}

impl LoopbackDriver {
    /// Port name served by this pair.
    pub fn port_name(&self) -> &str {
        &self.shared.port_name
    }

    /// Queue a raw message for the next posted fetch. Returns its message key.
    pub fn push_message(&self, bytes: Vec<u8>) -> u64 {
        let mut state = self.shared.lock();
        let key = state.next_message_key;
        state.next_message_key += 1;
        state.queue.push_back((key, bytes));
        drop(state);
        self.shared.messages.notify_one();
        key
    }

    /// Messages queued but not yet delivered.
    pub fn pending_messages(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Wait up to `timeout` for the next reply.
    pub fn next_reply(&self, timeout: Duration) -> Option<LoopbackReply> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if let Some(reply) = state.replies.pop_front() {
                return Some(reply);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .shared
                .replies
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drain every reply received so far.
    pub fn take_replies(&self) -> Vec<LoopbackReply> {
        self.shared.lock().replies.drain(..).collect()
    }

    /// Answer commands with `handler`; `Err(status)` fails the send.
    pub fn set_command_handler<F>(&self, handler: F)
    where
        F: FnMut(&[u8]) -> std::result::Result<Vec<u8>, i32> + Send + 'static,
    {
        *self
            .shared
            .command_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(handler));
    }

    /// Make the next call of `op` fail with `status`.
    pub fn fail_next(&self, op: LoopbackOp, status: i32) {
        self.shared.lock().failures.insert(op, status);
    }

    pub fn stats(&self) -> LoopbackStats {
        self.shared.lock().stats.clone()
    }

    pub fn journal(&self) -> Vec<LoopbackEvent> {
        self.shared.lock().journal.clone()
    }

    /// Wait until `predicate` holds for the stats, or `timeout` elapses.
    pub fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&LoopbackStats) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.stats()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// In-memory extension manager.
///
/// Filters must be [`install`](LoopbackManager::install)ed before they can
/// be loaded; only loaded filters are enumerated.
#[derive(Default)]
pub struct LoopbackManager {
    filters: Mutex<BTreeMap<String, InstalledFilter>>,
}

struct InstalledFilter {
    altitude: String,
    loaded: bool,
    instances: BTreeSet<(String, String)>,
}

impl LoopbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter that `load` will accept, with its altitude.
    pub fn install(&self, name: &str, altitude: &str) {
        self.lock().insert(
            name.to_string(),
            InstalledFilter {
                altitude: altitude.to_string(),
                loaded: false,
                instances: BTreeSet::new(),
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, InstalledFilter>> {
        self.filters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loaded<'a>(
        filters: &'a mut BTreeMap<String, InstalledFilter>,
        name: &str,
        op: &'static str,
    ) -> Result<&'a mut InstalledFilter> {
        match filters.get_mut(name) {
            Some(filter) if filter.loaded => Ok(filter),
            Some(_) => Err(Self::native(op, ERROR_SERVICE_NOT_ACTIVE)),
            None => Err(Self::native(op, ERROR_FILE_NOT_FOUND)),
        }
    }

    fn native(op: &'static str, win32: u32) -> TransportError {
        TransportError::Native {
            op,
            status: (0x8007_0000 | win32) as i32,
        }
    }
}

const ERROR_FILE_NOT_FOUND: u32 = 2;
const ERROR_SERVICE_ALREADY_RUNNING: u32 = 1056;
const ERROR_SERVICE_NOT_ACTIVE: u32 = 1062;

impl FilterManager for LoopbackManager {
    fn load(&self, name: &str) -> Result<()> {
        let mut filters = self.lock();
        let filter = filters
            .get_mut(name)
            .ok_or_else(|| Self::native("FilterLoad", ERROR_FILE_NOT_FOUND))?;
        if filter.loaded {
            return Err(Self::native("FilterLoad", ERROR_SERVICE_ALREADY_RUNNING));
        }
        filter.loaded = true;
        debug!(filter = name, "loopback filter loaded");
        Ok(())
    }

    fn unload(&self, name: &str) -> Result<()> {
        let mut filters = self.lock();
        let filter = Self::loaded(&mut filters, name, "FilterUnload")?;
        filter.loaded = false;
        filter.instances.clear();
        debug!(filter = name, "loopback filter unloaded");
        Ok(())
    }

    fn attach(&self, name: &str, volume: &str, instance: Option<&str>) -> Result<String> {
        let mut filters = self.lock();
        let filter = Self::loaded(&mut filters, name, "FilterAttach")?;
        let instance = instance
            .map(str::to_string)
            .unwrap_or_else(|| format!("{name} Instance"));
        filter
            .instances
            .insert((volume.to_string(), instance.clone()));
        Ok(instance)
    }

    fn detach(&self, name: &str, volume: &str, instance: Option<&str>) -> Result<()> {
        let mut filters = self.lock();
        let filter = Self::loaded(&mut filters, name, "FilterDetach")?;
        let before = filter.instances.len();
        filter.instances.retain(|(vol, inst)| {
            vol.as_str() != volume || instance.is_some_and(|i| i != inst.as_str())
        });
        if filter.instances.len() == before {
            return Err(Self::native("FilterDetach", ERROR_FILE_NOT_FOUND));
        }
        Ok(())
    }

    fn enumerate(&self) -> Result<Vec<FilterInfo>> {
        Ok(self
            .lock()
            .iter()
            .filter(|(_, filter)| filter.loaded)
            .map(|(name, filter)| FilterInfo {
                name: name.clone(),
                altitude: filter.altitude.clone(),
                instance_count: filter.instances.len() as u32,
                frame_id: 0,
            })
            .collect())
    }
}
