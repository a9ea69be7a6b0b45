/// Errors that can occur in filter port transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to connect to the named communication port.
    #[error("failed to connect to port {name}: {source}")]
    Connect {
        name: String,
        source: std::io::Error,
    },

    /// A native call returned a failure status (`HRESULT`, `NTSTATUS` or errno).
    #[error("{op} failed with status 0x{status:08X}")]
    Native { op: &'static str, status: i32 },

    /// An I/O error occurred on the port.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message did not fit into the buffer posted for it.
    #[error("message too large ({size} bytes, buffer holds {capacity})")]
    MessageTooLarge { size: usize, capacity: usize },

    /// The request is not in a state that allows the operation.
    #[error("fetch request is {state}, cannot {op}")]
    RequestState {
        op: &'static str,
        state: crate::traits::FetchState,
    },

    /// The port or completion handle has been closed.
    #[error("port closed")]
    Closed,

    /// The operation is not available on this platform or backend.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Native status code carried by this error, if any.
    pub fn status(&self) -> Option<i32> {
        match self {
            TransportError::Native { status, .. } => Some(*status),
            TransportError::Connect { source, .. } | TransportError::Io(source) => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
