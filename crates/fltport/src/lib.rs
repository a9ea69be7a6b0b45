//! User-mode client for file-system extension communication ports.
//!
//! fltport talks to an in-kernel file-system extension (a filter-manager
//! minifilter on Windows): synchronous commands out, asynchronous
//! notifications in, answered concurrently by a pool of monitor workers.
//!
//! # Crate Structure
//!
//! - [`transport`]: OS boundary: ports, completion handles, extension
//!   lifecycle, and an in-process loopback backend
//! - [`wire`]: Binary codec for commands, notifications and replies
//! - [`client`]: Connection state machine and monitor workers (behind
//!   `client` feature)

/// Re-export transport types.
pub mod transport {
    pub use fltport_transport::*;
}

/// Re-export wire codec types.
pub mod wire {
    pub use fltport_wire::*;
}

/// Re-export client types (requires `client` feature).
#[cfg(feature = "client")]
pub mod client {
    pub use fltport_client::*;
}
