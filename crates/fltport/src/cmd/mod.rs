use clap::{Args, Subcommand};
use std::path::PathBuf;

use fltport_transport::FilterManager;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod doctor;
pub mod filters;
pub mod monitor;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute one command against a communication port.
    Send(SendArgs),
    /// Answer notifications from a communication port until interrupted.
    Monitor(MonitorArgs),
    /// List installed file-system extensions.
    Filters(FiltersArgs),
    /// Load a file-system extension.
    Load(LifecycleArgs),
    /// Unload a file-system extension.
    Unload(LifecycleArgs),
    /// Run a loopback self-test and local environment checks.
    Doctor(DoctorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, format),
        Command::Monitor(args) => monitor::run(args, format),
        Command::Filters(args) => filters::list(args, format),
        Command::Load(args) => filters::load(args),
        Command::Unload(args) => filters::unload(args),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Communication port name (e.g. \ScannerPort).
    #[arg(env = "FLTPORT_PORT")]
    pub port: String,
    /// Command type code.
    #[arg(long = "type", short = 't', allow_negative_numbers = true)]
    pub type_code: i32,
    /// UTF-8 string payload.
    #[arg(long, conflicts_with_all = ["hex", "utf16", "file"])]
    pub data: Option<String>,
    /// Hex-encoded payload (e.g. 0a0b0c).
    #[arg(long, conflicts_with_all = ["data", "utf16", "file"])]
    pub hex: Option<String>,
    /// String payload encoded as NUL-terminated UTF-16LE.
    #[arg(long, conflicts_with_all = ["data", "hex", "file"])]
    pub utf16: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["data", "hex", "utf16"])]
    pub file: Option<PathBuf>,
    /// Exact response size in bytes. Zero means no response.
    #[arg(long, default_value = "0")]
    pub response_size: usize,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Communication port name (e.g. \ScannerPort).
    #[arg(env = "FLTPORT_PORT")]
    pub port: String,
    /// Notification type codes to answer (comma-separated).
    #[arg(long, value_delimiter = ',', required = true, allow_negative_numbers = true)]
    pub types: Vec<i32>,
    /// Monitor worker count. Default: host concurrency.
    #[arg(long, env = "FLTPORT_WORKERS")]
    pub workers: Option<usize>,
    /// Completion wait bound in milliseconds.
    #[arg(long, env = "FLTPORT_POLL_MS", default_value = "300")]
    pub poll_ms: u64,
    /// Status to reply with. Non-zero reports failure to the extension.
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    pub reply_status: i32,
    /// Load this extension before connecting.
    #[arg(long, value_name = "NAME")]
    pub load: Option<String>,
    /// Exit after answering N notifications.
    #[arg(long)]
    pub count: Option<u64>,
}

#[derive(Args, Debug, Default)]
pub struct FiltersArgs {}

#[derive(Args, Debug)]
pub struct LifecycleArgs {
    /// Extension (service) name.
    pub name: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}

/// Native port transport for this platform.
#[cfg(windows)]
pub fn native_transport() -> CliResult<fltport_transport::FilterManagerTransport> {
    Ok(fltport_transport::FilterManagerTransport::new())
}

// Off Windows the type only satisfies the signature; no value is produced.
#[cfg(not(windows))]
pub fn native_transport() -> CliResult<fltport_transport::LoopbackTransport> {
    Err(unsupported_platform())
}

/// Native extension manager for this platform.
pub fn native_manager() -> CliResult<Box<dyn FilterManager>> {
    #[cfg(windows)]
    {
        Ok(Box::new(fltport_transport::FltLib::new()))
    }

    #[cfg(not(windows))]
    {
        Err(unsupported_platform())
    }
}

#[cfg(not(windows))]
fn unsupported_platform() -> crate::exit::CliError {
    crate::exit::CliError::new(
        crate::exit::TRANSPORT_ERROR,
        "the filter manager backend requires Windows (run `fltport doctor` for the loopback self-test)",
    )
}
