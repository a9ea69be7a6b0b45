use std::fmt;

use crate::monitor::WorkerExit;

/// Lifecycle of a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Created = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
    Faulted = 5,
}

impl ConnectionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Created,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Faulted,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Created => "created",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Faulted => "faulted",
        }
    }

    /// Whether a connect may start from this state.
    pub fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Created | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives lifecycle callbacks from a connection.
///
/// Callbacks run while the connection's exclusivity lock is held and must
/// not call back into the connection.
pub trait ConnectionObserver: Send + Sync {
    /// A state transition happened.
    fn state_changed(&self, from: ConnectionState, to: ConnectionState) {
        let _ = (from, to);
    }

    /// A monitor worker was joined.
    fn worker_exited(&self, slot: usize, exit: &WorkerExit) {
        let _ = (slot, exit);
    }
}
