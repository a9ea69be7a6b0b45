use std::fmt;
use std::io;

use fltport_client::{ClientError, ErrorKind};
use fltport_transport::TransportError;
use fltport_wire::STATUS_ACCESS_DENIED;

// Exit code constants aligned with rsfulmen/DDR-0002 semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const INTERNAL: i32 = 125;

const E_ACCESSDENIED: i32 = 0x8007_0005_u32 as i32;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Connect { source, .. } | TransportError::Io(source) => {
            io_error(context, source)
        }
        TransportError::Native { status, .. }
            if status == E_ACCESSDENIED || status == STATUS_ACCESS_DENIED =>
        {
            CliError::new(PERMISSION_DENIED, format!("{context}: {err}"))
        }
        TransportError::Unsupported(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn client_error(context: &str, err: ClientError) -> CliError {
    match err.kind() {
        ErrorKind::Validation => CliError::new(USAGE, format!("{context}: {err}")),
        ErrorKind::Conflict => CliError::new(FAILURE, format!("{context}: {err}")),
        ErrorKind::Protocol => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        ErrorKind::Faulted => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        ErrorKind::Transport => match err {
            ClientError::Transport(err) => transport_error(context, err),
            other => CliError::new(INTERNAL, format!("{context}: {other}")),
        },
    }
}
