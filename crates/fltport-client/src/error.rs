use fltport_transport::TransportError;
use fltport_wire::WireError;

use crate::state::ConnectionState;

/// Coarse classification of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad argument or configuration; nothing was attempted.
    Validation,
    /// The operation is not legal in the current state.
    Conflict,
    /// Wire size or shape mismatch.
    Protocol,
    /// Native failure underneath the client.
    Transport,
    /// The connection faulted earlier.
    Faulted,
}

/// Errors that can occur in client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Invalid configuration or argument.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// Operation attempted in the wrong state.
    #[error("cannot {op} while {state}")]
    Conflict {
        op: &'static str,
        state: ConnectionState,
    },

    /// Wire-level error.
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// A notification arrived for a type with no registered handler.
    #[error("no handler registered for notification type {0}")]
    UnhandledNotification(i32),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A monitor worker thread could not be started.
    #[error("failed to spawn monitor worker {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: std::io::Error,
    },

    /// A monitor worker panicked.
    #[error("monitor worker {slot} panicked")]
    WorkerPanicked { slot: usize },

    /// A monitor worker stopped on an unrecoverable error.
    #[error("monitor worker {slot} faulted: {reason}")]
    WorkerFaulted { slot: usize, reason: String },

    /// The connection is faulted; only release is permitted.
    #[error("connection is faulted")]
    Faulted,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Validation(_) => ErrorKind::Validation,
            ClientError::Conflict { .. } => ErrorKind::Conflict,
            ClientError::Protocol(_) | ClientError::UnhandledNotification(_) => {
                ErrorKind::Protocol
            }
            ClientError::Transport(_)
            | ClientError::Spawn { .. }
            | ClientError::WorkerPanicked { .. }
            | ClientError::WorkerFaulted { .. } => ErrorKind::Transport,
            ClientError::Faulted => ErrorKind::Faulted,
        }
    }

    /// Native status code, when the failure came from the OS.
    pub fn status(&self) -> Option<i32> {
        match self {
            ClientError::Transport(err) => err.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
