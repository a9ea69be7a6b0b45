use std::sync::Arc;

use bytes::Bytes;
use fltport_transport::FilterTransport;
use fltport_wire::{decode_response, Command, FixedResponse};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::handler::NotificationHandler;
use crate::state::{ConnectionObserver, ConnectionState};

/// Public entry point: commands out, notifications in.
///
/// ```no_run
/// use bytes::Bytes;
/// use fltport_client::{ClientConfig, DriverClient, HandlerResult};
/// use fltport_transport::loopback;
/// use fltport_wire::{Command, Notification};
///
/// let (transport, _driver) = loopback("\\ScannerPort");
/// let client = DriverClient::new(transport, ClientConfig::new("\\ScannerPort"));
/// client
///     .register_handler(1, |n: &Notification<'_>| -> HandlerResult {
///         Ok(Some(Bytes::copy_from_slice(n.payload())))
///     })
///     .expect("handler should register before connect");
/// client.connect().expect("client should connect");
/// let version: u32 = client
///     .execute_typed(&Command::empty(0))
///     .expect("command should succeed");
/// # let _ = version;
/// client.disconnect().expect("client should disconnect");
/// ```
pub struct DriverClient<T: FilterTransport> {
    connection: Connection<T>,
}

impl<T: FilterTransport> DriverClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self {
            connection: Connection::new(transport, config),
        }
    }

    pub fn with_observer(
        transport: T,
        config: ClientConfig,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        Self {
            connection: Connection::with_observer(transport, config, observer),
        }
    }

    pub fn connect(&self) -> Result<()> {
        self.connection.connect()
    }

    pub fn disconnect(&self) -> Result<()> {
        self.connection.disconnect()
    }

    pub fn release(&self) -> Result<()> {
        self.connection.release()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn config(&self) -> &ClientConfig {
        self.connection.config()
    }

    pub fn connection(&self) -> &Connection<T> {
        &self.connection
    }

    /// Send a command that expects no response.
    pub fn execute(&self, command: &Command) -> Result<()> {
        self.connection.send_command(command, 0).map(drop)
    }

    /// Send a command and decode its fixed-size response.
    pub fn execute_typed<R: FixedResponse>(&self, command: &Command) -> Result<R> {
        let raw = self.connection.send_command(command, R::WIRE_SIZE)?;
        Ok(decode_response(&raw)?)
    }

    /// Send a command and return exactly `response_size` raw response bytes.
    pub fn execute_raw(&self, command: &Command, response_size: usize) -> Result<Bytes> {
        self.connection.send_command(command, response_size)
    }

    /// Register the handler for notifications of `type_code`.
    pub fn register_handler<H: NotificationHandler>(&self, type_code: i32, handler: H) -> Result<()> {
        self.connection.register_handler(type_code, handler)
    }
}
