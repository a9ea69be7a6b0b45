use std::time::Duration;

use fltport_transport::default_concurrency;
use fltport_wire::{DEFAULT_MAX_PAYLOAD, NOTIFICATION_HEADER_SIZE};

use crate::error::{ClientError, Result};

/// Default bound on each completion wait; also the cancellation latency.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Upper bound on monitor workers per connection.
pub const MAX_WORKERS: usize = 256;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Communication port name, e.g. `\ScannerPort`.
    pub port_name: String,
    /// Monitor workers started on connect.
    pub worker_count: usize,
    /// Bound on each completion wait.
    pub poll_interval: Duration,
    /// Largest notification payload accepted, header excluded.
    pub max_notification_payload: usize,
}

impl ClientConfig {
    /// Configuration for `port_name` with host-derived defaults.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            worker_count: default_concurrency(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_notification_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_notification_payload(mut self, max: usize) -> Self {
        self.max_notification_payload = max;
        self
    }

    /// Size of each worker's fetch buffer.
    pub fn fetch_buffer_size(&self) -> usize {
        NOTIFICATION_HEADER_SIZE + self.max_notification_payload
    }

    /// Check the configuration without touching any connection state.
    pub fn validate(&self) -> Result<()> {
        if self.port_name.is_empty() {
            return Err(ClientError::Validation("port name is empty".into()));
        }
        if self.port_name.contains('\0') {
            return Err(ClientError::Validation(
                "port name contains a NUL character".into(),
            ));
        }
        if self.worker_count == 0 || self.worker_count > MAX_WORKERS {
            return Err(ClientError::Validation(format!(
                "worker count {} outside 1..={MAX_WORKERS}",
                self.worker_count
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ClientError::Validation("poll interval is zero".into()));
        }
        if self.max_notification_payload > i32::MAX as usize - NOTIFICATION_HEADER_SIZE {
            return Err(ClientError::Validation(format!(
                "max notification payload {} exceeds the wire limit",
                self.max_notification_payload
            )));
        }
        Ok(())
    }
}
