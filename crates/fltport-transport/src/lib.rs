//! Kernel file-system extension transport.
//!
//! Abstracts the native surface a user-mode client needs: connecting to a
//! communication port, synchronous command round trips, overlapped message
//! fetches delivered through a completion handle, and extension lifecycle
//! administration.
//!
//! Backends:
//! - the Windows filter manager (`fltlib`)
//! - an in-process loopback usable on every platform
//!
//! This is the lowest layer of fltport. Everything else builds on the
//! [`FilterTransport`] trait provided here.

pub mod buffer;
pub mod error;
pub mod loopback;
pub mod manager;
pub mod sysinfo;
pub mod traits;

#[cfg(windows)]
pub mod windows;

pub use buffer::Buffer;
pub use error::{Result, TransportError};
pub use loopback::{
    loopback, LoopbackDriver, LoopbackEvent, LoopbackManager, LoopbackOp, LoopbackReply,
    LoopbackStats, LoopbackTransport,
};
pub use manager::{FilterInfo, FilterManager};
pub use sysinfo::default_concurrency;
pub use traits::{
    CommunicationPort, CompletionPort, FetchRequest, FetchState, FilterTransport, WaitStatus,
};

#[cfg(windows)]
pub use windows::{FilterCompletion, FilterManagerTransport, FilterPort, FltLib};
