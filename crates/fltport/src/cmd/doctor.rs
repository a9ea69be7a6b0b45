use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use fltport_client::{ClientConfig, ConnectionState, DriverClient, HandlerResult};
use fltport_transport::{default_concurrency, loopback};
use fltport_wire::{decode_command, decode_reply, encode_notification, Command, Notification};
use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::OutputFormat;

const SELF_TEST_PORT: &str = "\\FltportDoctor";
const SELF_TEST_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Info,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    schema_id: &'static str,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(_args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        platform_backend_check(),
        host_concurrency_check(),
        loopback_lifecycle_check(),
        loopback_fault_check(),
        filter_manager_check(),
        compiled_features_check(),
    ];

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let overall = if has_fail { "fail" } else { "pass" };

    let output = DoctorOutput {
        schema_id: "https://schemas.3leaps.dev/fltport/cli/v1/doctor-report.schema.json",
        checks,
        overall,
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("fltport doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<22} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => {
            println!("{}", output.overall);
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Warn => "WARN",
        CheckStatus::Info => "INFO",
        CheckStatus::Skip => "SKIP",
    }
}

fn platform_backend_check() -> CheckResult {
    if cfg!(windows) {
        CheckResult::new(
            "platform_backend",
            CheckStatus::Pass,
            "filter manager backend available",
        )
    } else {
        CheckResult::new(
            "platform_backend",
            CheckStatus::Info,
            "filter manager backend requires Windows; loopback only",
        )
    }
}

fn host_concurrency_check() -> CheckResult {
    CheckResult::new(
        "host_concurrency",
        CheckStatus::Info,
        format!("{} monitor workers by default", default_concurrency()),
    )
}

/// Connect, run a command, answer a notification, disconnect.
fn loopback_lifecycle_check() -> CheckResult {
    match loopback_lifecycle() {
        Ok(detail) => CheckResult::new("loopback_lifecycle", CheckStatus::Pass, detail),
        Err(detail) => CheckResult::new("loopback_lifecycle", CheckStatus::Fail, detail),
    }
}

fn loopback_lifecycle() -> Result<String, String> {
    let (transport, driver) = loopback(SELF_TEST_PORT);
    driver.set_command_handler(|raw| {
        let command = decode_command(raw, raw.len()).map_err(|_| -1)?;
        Ok((command.payload.len() as u32).to_le_bytes().to_vec())
    });

    let config = ClientConfig::new(SELF_TEST_PORT).with_worker_count(2);
    let client = DriverClient::new(transport, config);
    client
        .register_handler(1, |n: &Notification<'_>| -> HandlerResult {
            Ok(Some(Bytes::copy_from_slice(n.payload())))
        })
        .map_err(|err| format!("register: {err}"))?;

    let started = Instant::now();
    client.connect().map_err(|err| format!("connect: {err}"))?;

    let len: u32 = client
        .execute_typed(&Command::new(7, &b"doctor"[..]))
        .map_err(|err| format!("execute: {err}"))?;
    if len != 6 {
        return Err(format!("execute: extension saw {len} bytes, expected 6"));
    }

    let mut note = BytesMut::new();
    encode_notification(11, 1, b"ping", 12, &mut note).map_err(|err| format!("encode: {err}"))?;
    driver.push_message(note.to_vec());
    let reply = driver
        .next_reply(SELF_TEST_WAIT)
        .ok_or_else(|| "no reply to notification".to_string())?;
    let (header, body) = decode_reply(&reply.bytes).map_err(|err| format!("reply: {err}"))?;
    if header.message_id != 11 || header.status != 0 || &body.payload[..] != b"ping" {
        return Err(format!("unexpected reply {header:?}"));
    }

    client
        .disconnect()
        .map_err(|err| format!("disconnect: {err}"))?;
    let stats = driver.stats();
    if stats.open_ports != 0 || stats.open_completions != 0 {
        return Err("handles leaked after disconnect".to_string());
    }
    Ok(format!(
        "connect/execute/reply/disconnect in {} ms",
        started.elapsed().as_millis()
    ))
}

/// An unhandled notification type must fault the connection.
fn loopback_fault_check() -> CheckResult {
    let (transport, driver) = loopback(SELF_TEST_PORT);
    let config = ClientConfig::new(SELF_TEST_PORT)
        .with_worker_count(1)
        .with_poll_interval(Duration::from_millis(50));
    let client = DriverClient::new(transport, config);
    if let Err(err) = client.connect() {
        return CheckResult::new("loopback_fault", CheckStatus::Fail, format!("connect: {err}"));
    }

    let mut note = BytesMut::new();
    if encode_notification(1, 99, b"", 8, &mut note).is_err() {
        return CheckResult::new("loopback_fault", CheckStatus::Fail, "encode failed");
    }
    driver.push_message(note.to_vec());

    let deadline = Instant::now() + SELF_TEST_WAIT;
    while client.state() != ConnectionState::Faulted && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    match client.state() {
        ConnectionState::Faulted if driver.stats().replies == 0 => CheckResult::new(
            "loopback_fault",
            CheckStatus::Pass,
            "unhandled notification faulted the connection",
        ),
        state => CheckResult::new(
            "loopback_fault",
            CheckStatus::Fail,
            format!("connection is {state} after unhandled notification"),
        ),
    }
}

fn filter_manager_check() -> CheckResult {
    #[cfg(windows)]
    {
        use fltport_transport::FilterManager;

        match fltport_transport::FltLib::new().enumerate() {
            Ok(filters) => CheckResult::new(
                "filter_manager",
                CheckStatus::Pass,
                format!("{} filters loaded", filters.len()),
            ),
            Err(err) => CheckResult::new(
                "filter_manager",
                CheckStatus::Warn,
                format!("enumeration failed (administrator rights required?): {err}"),
            ),
        }
    }

    #[cfg(not(windows))]
    {
        CheckResult::new(
            "filter_manager",
            CheckStatus::Skip,
            "filter manager not available on this platform",
        )
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "client") {
        features.push("client");
    }
    if cfg!(feature = "cli") {
        features.push("cli");
    }
    CheckResult::new("compiled_features", CheckStatus::Info, features.join(", "))
}
