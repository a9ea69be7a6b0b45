use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use fltport_transport::FilterInfo;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ResponseOutput<'a> {
    schema_id: &'a str,
    port: &'a str,
    type_code: i32,
    response_size: usize,
    response: String,
    timestamp: String,
}

pub fn print_response(port: &str, type_code: i32, response: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ResponseOutput {
                schema_id: "https://schemas.3leaps.dev/fltport/cli/v1/command-response.schema.json",
                port,
                type_code,
                response_size: response.len(),
                response: payload_preview(response),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PORT", "TYPE", "SIZE", "RESPONSE"])
                .add_row(vec![
                    port.to_string(),
                    type_code.to_string(),
                    response.len().to_string(),
                    payload_preview(response),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "port={} type={} size={} response={}",
                port,
                type_code,
                response.len(),
                payload_preview(response)
            );
        }
        OutputFormat::Raw => print_raw(response),
    }
}

#[derive(Serialize)]
struct NotificationOutput<'a> {
    schema_id: &'a str,
    message_id: i32,
    type_code: i32,
    reply_capacity: usize,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

/// Print one received notification. Called from monitor worker threads.
pub fn print_notification(
    message_id: i32,
    type_code: i32,
    reply_capacity: usize,
    payload: &[u8],
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            let out = NotificationOutput {
                schema_id: "https://schemas.3leaps.dev/fltport/cli/v1/notification-received.schema.json",
                message_id,
                type_code,
                reply_capacity,
                payload_size: payload.len(),
                payload: payload_preview(payload),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!(
                "message={} type={} reply_capacity={} size={} payload={}",
                message_id,
                type_code,
                reply_capacity,
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

#[derive(Serialize)]
struct FilterOutput<'a> {
    name: &'a str,
    altitude: &'a str,
    instances: u32,
    frame_id: u32,
}

#[derive(Serialize)]
struct FiltersOutput<'a> {
    schema_id: &'a str,
    filters: Vec<FilterOutput<'a>>,
}

pub fn print_filters(filters: &[FilterInfo], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = FiltersOutput {
                schema_id: "https://schemas.3leaps.dev/fltport/cli/v1/filters.schema.json",
                filters: filters
                    .iter()
                    .map(|f| FilterOutput {
                        name: &f.name,
                        altitude: &f.altitude,
                        instances: f.instance_count,
                        frame_id: f.frame_id,
                    })
                    .collect(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NAME", "ALTITUDE", "INSTANCES", "FRAME"]);
            for f in filters {
                table.add_row(vec![
                    f.name.clone(),
                    f.altitude.clone(),
                    f.instance_count.to_string(),
                    f.frame_id.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for f in filters {
                println!(
                    "{} altitude={} instances={} frame={}",
                    f.name, f.altitude, f.instance_count, f.frame_id
                );
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// Printable text as-is; anything else as lowercase hex.
pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) if !text.chars().any(|c| c.is_control()) => text.to_string(),
        _ => payload.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_keeps_text_and_hexes_binary() {
        assert_eq!(payload_preview(b"scan ok"), "scan ok");
        assert_eq!(payload_preview(&[0x01, 0xff]), "01ff");
        assert_eq!(payload_preview(b"a\0"), "6100");
        assert_eq!(payload_preview(b""), "");
    }
}
