use std::fmt;
use std::time::Duration;

use crate::buffer::Buffer;
use crate::error::{Result, TransportError};

/// Opens communication ports and binds completion handles to them.
///
/// One implementation per backend: the filter manager on Windows and the
/// in-process loopback everywhere.
pub trait FilterTransport: Send + Sync + 'static {
    /// Connected port type.
    type Port: CommunicationPort;
    /// Completion-delivery handle type.
    type Completion: CompletionPort;

    /// Connect to the named communication port.
    fn connect(&self, port_name: &str) -> Result<Self::Port>;

    /// Bind a completion-delivery handle to `port`, allowing up to
    /// `concurrency` threads to process completions concurrently.
    fn bind_completion(&self, port: &Self::Port, concurrency: usize) -> Result<Self::Completion>;

    /// Backend name for diagnostics.
    fn transport_name(&self) -> &'static str;
}

/// A connected duplex channel to the kernel extension.
///
/// Shared read-only by every monitor worker once connected.
pub trait CommunicationPort: Send + Sync + 'static {
    /// Send `command` and wait for the extension to handle it.
    ///
    /// The extension may write a response into `response`; returns the
    /// number of bytes written. An empty `response` means no response is
    /// expected.
    fn send_message(&self, command: &[u8], response: &mut [u8]) -> Result<usize>;

    /// Post an asynchronous fetch of the next message into `request`.
    ///
    /// Completion is observed through [`CompletionPort::wait`].
    fn get_message(&self, request: &mut FetchRequest) -> Result<()>;

    /// Answer the message held by a completed `request`.
    fn reply_message(&self, request: &FetchRequest, reply: &[u8]) -> Result<()>;

    /// Cancel the outstanding fetch of `request`.
    ///
    /// Once this returns the extension no longer writes into the request's
    /// storage. A request that is not pending is left untouched.
    fn cancel_io(&self, request: &mut FetchRequest) -> Result<()>;

    /// Release the native handle. Later calls fail with [`TransportError::Closed`].
    fn close(&self) -> Result<()>;
}

/// Completion-delivery handle bound to a port.
pub trait CompletionPort: Send + Sync + 'static {
    /// Wait up to `timeout` for the pending fetch of `request` to complete.
    ///
    /// A timeout leaves the request pending so the caller can wait again.
    fn wait(&self, request: &mut FetchRequest, timeout: Duration) -> Result<WaitStatus>;

    /// Release the native handle.
    fn close(&self) -> Result<()>;
}

/// Outcome of a bounded completion wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The request completed; its message is available.
    Completed,
    /// The interval elapsed with the request still pending.
    TimedOut,
}

/// Lifecycle of a fetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Pending,
    Completed,
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchState::Idle => "idle",
            FetchState::Pending => "pending",
            FetchState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// One worker's fetch-next-message operation and the buffer it fills.
///
/// The request owns its buffer for its whole life, so the storage is never
/// shared between concurrent operations.
#[derive(Debug)]
pub struct FetchRequest {
    buffer: Buffer,
    state: FetchState,
    token: u64,
    message_key: u64,
}

impl FetchRequest {
    pub fn new(buffer: Buffer) -> Self {
        Self {
            buffer,
            state: FetchState::Idle,
            token: 0,
            message_key: 0,
        }
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == FetchState::Pending
    }

    /// Bytes the request can receive.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Transport-assigned identity of the current operation.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Transport key addressing the reply to the completed message.
    pub fn message_key(&self) -> u64 {
        self.message_key
    }

    /// The received message. Empty unless the request has completed.
    pub fn message(&self) -> &[u8] {
        match self.state {
            FetchState::Completed => self.buffer.as_slice(),
            _ => &[],
        }
    }

    /// Mark the request as posted under `token`.
    pub fn begin(&mut self, token: u64) -> Result<()> {
        if self.state == FetchState::Pending {
            return Err(TransportError::RequestState {
                op: "post a fetch",
                state: self.state,
            });
        }
        self.buffer.clear();
        self.token = token;
        self.message_key = 0;
        self.state = FetchState::Pending;
        Ok(())
    }

    /// Deliver `message` into the request and mark it completed.
    pub fn complete(&mut self, message_key: u64, message: &[u8]) -> Result<()> {
        if self.state != FetchState::Pending {
            return Err(TransportError::RequestState {
                op: "complete",
                state: self.state,
            });
        }
        if message.len() > self.buffer.capacity() {
            self.state = FetchState::Idle;
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                capacity: self.buffer.capacity(),
            });
        }
        self.buffer.fill_from(message);
        self.message_key = message_key;
        self.state = FetchState::Completed;
        Ok(())
    }

    /// Return a cancelled or failed request to idle.
    pub fn abandon(&mut self) {
        self.buffer.clear();
        self.state = FetchState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lifecycle() {
        let mut req = FetchRequest::new(Buffer::with_capacity(8));
        assert_eq!(req.state(), FetchState::Idle);
        assert!(req.message().is_empty());

        req.begin(7).expect("idle request should post");
        assert!(req.is_pending());
        assert_eq!(req.token(), 7);
        assert!(req.message().is_empty());

        req.complete(42, b"abcd").expect("pending request should complete");
        assert_eq!(req.state(), FetchState::Completed);
        assert_eq!(req.message(), b"abcd");
        assert_eq!(req.message_key(), 42);

        req.begin(8).expect("completed request can be reposted");
        assert!(req.message().is_empty());
    }

    #[test]
    fn double_post_is_rejected() {
        let mut req = FetchRequest::new(Buffer::with_capacity(8));
        req.begin(1).unwrap();
        let err = req.begin(2).unwrap_err();
        assert!(matches!(
            err,
            TransportError::RequestState {
                state: FetchState::Pending,
                ..
            }
        ));
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut req = FetchRequest::new(Buffer::with_capacity(4));
        req.begin(1).unwrap();
        let err = req.complete(1, b"too long").unwrap_err();
        assert!(matches!(
            err,
            TransportError::MessageTooLarge {
                size: 8,
                capacity: 4
            }
        ));
        assert_eq!(req.state(), FetchState::Idle);
    }

    #[test]
    fn complete_requires_pending() {
        let mut req = FetchRequest::new(Buffer::with_capacity(4));
        assert!(req.complete(1, b"x").is_err());
    }
}
