use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fltport_client::{
    ClientConfig, ConnectionState, DriverClient, HandlerError, HandlerResult,
};
use fltport_transport::{default_concurrency, FilterTransport};
use fltport_wire::Notification;
use tracing::info;

use crate::cmd::{native_manager, native_transport, MonitorArgs};
use crate::exit::{client_error, transport_error, CliError, CliResult, SUCCESS, TRANSPORT_ERROR};
use crate::output::{print_notification, OutputFormat};

const IDLE_TICK: Duration = Duration::from_millis(100);

pub fn run(args: MonitorArgs, format: OutputFormat) -> CliResult<i32> {
    if let Some(name) = &args.load {
        native_manager()?
            .load(name)
            .map_err(|err| transport_error(&format!("failed loading {name}"), err))?;
        info!(filter = %name, "extension loaded");
    }

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let transport = native_transport()?;
    let answered = monitor(transport, &args, format, &running)?;
    info!(answered, "monitor stopped");
    Ok(SUCCESS)
}

/// Answer notifications until `running` clears, `--count` is reached, or
/// the connection faults. Returns the number of notifications answered.
pub(crate) fn monitor<T: FilterTransport>(
    transport: T,
    args: &MonitorArgs,
    format: OutputFormat,
    running: &AtomicBool,
) -> CliResult<u64> {
    let config = ClientConfig::new(args.port.clone())
        .with_worker_count(args.workers.unwrap_or_else(default_concurrency))
        .with_poll_interval(Duration::from_millis(args.poll_ms));
    let client = DriverClient::new(transport, config);

    let answered = Arc::new(AtomicU64::new(0));
    let reply_status = args.reply_status;
    for &type_code in &args.types {
        let answered = answered.clone();
        client
            .register_handler(type_code, move |n: &Notification<'_>| -> HandlerResult {
                print_notification(
                    n.message_id(),
                    n.type_code(),
                    n.reply_capacity(),
                    n.payload(),
                    format,
                );
                answered.fetch_add(1, Ordering::SeqCst);
                if reply_status == 0 {
                    Ok(None)
                } else {
                    Err(HandlerError::new(reply_status, "configured reply status"))
                }
            })
            .map_err(|err| client_error("handler registration failed", err))?;
    }

    client
        .connect()
        .map_err(|err| client_error("connect failed", err))?;
    info!(
        port = %args.port,
        workers = client.config().worker_count,
        types = ?args.types,
        "monitoring"
    );

    while running.load(Ordering::SeqCst) {
        if client.state() != ConnectionState::Connected {
            return Err(CliError::new(
                TRANSPORT_ERROR,
                format!("connection to {} faulted", args.port),
            ));
        }
        if let Some(limit) = args.count {
            if answered.load(Ordering::SeqCst) >= limit {
                break;
            }
        }
        thread::sleep(IDLE_TICK);
    }

    client
        .disconnect()
        .map_err(|err| client_error("disconnect failed", err))?;
    Ok(answered.load(Ordering::SeqCst))
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(crate::exit::INTERNAL, format!("failed to set Ctrl-C handler: {err}")))
}
