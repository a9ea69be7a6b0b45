//! User-mode client for a kernel file-system extension.
//!
//! Owns the connection state machine, a pool of notification monitor
//! workers answering pushed notifications, and the command path. Built on
//! [`fltport_transport`] for the OS boundary and [`fltport_wire`] for the
//! byte layout.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod monitor;
pub mod state;

pub use client::DriverClient;
pub use config::{ClientConfig, DEFAULT_POLL_INTERVAL, MAX_WORKERS};
pub use connection::Connection;
pub use error::{ClientError, ErrorKind, Result};
pub use handler::{HandlerError, HandlerRegistry, HandlerResult, NotificationHandler};
pub use monitor::WorkerExit;
pub use state::{ConnectionObserver, ConnectionState};
