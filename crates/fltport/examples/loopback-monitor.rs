//! Run a client against the in-process loopback driver.
//!
//! The driver side queues a few file-open notifications and answers one
//! command; the client monitors with two workers and denies `.exe` opens.
//!
//! ```text
//! cargo run -p fltport --example loopback-monitor
//! ```

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use fltport::client::{ClientConfig, DriverClient, HandlerError, HandlerResult};
use fltport::transport::loopback;
use fltport::wire::{
    decode_reply, decode_utf16z, encode_notification, encode_utf16z, Command, Notification,
    STATUS_ACCESS_DENIED,
};

const PORT: &str = "\\ScannerPort";
const FILE_OPENED: i32 = 1;
const GET_VERSION: i32 = 100;

fn on_file_opened(notification: &Notification<'_>) -> HandlerResult {
    let path = decode_utf16z(notification.payload())
        .map_err(|err| HandlerError::unsuccessful(err.to_string()))?;
    if path.ends_with(".exe") {
        return Err(HandlerError::new(STATUS_ACCESS_DENIED, format!("blocked {path}")));
    }
    Ok(Some(Bytes::from_static(&[1])))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (transport, driver) = loopback(PORT);
    driver.set_command_handler(|payload| match payload {
        [] => Ok(vec![3, 0, 0, 0]),
        _ => Err(STATUS_ACCESS_DENIED),
    });

    let config = ClientConfig::new(PORT).with_worker_count(2);
    let client = DriverClient::new(transport, config);
    client.register_handler(FILE_OPENED, on_file_opened)?;
    client.connect()?;

    let version: u32 = client.execute_typed(&Command::empty(GET_VERSION))?;
    println!("driver version {version}");

    let paths = ["C:\\docs\\report.txt", "C:\\tmp\\setup.exe", "D:\\notes.md"];
    for (id, path) in (1..).zip(paths) {
        let mut buf = BytesMut::new();
        encode_notification(id, FILE_OPENED, &encode_utf16z(path), 16, &mut buf)?;
        driver.push_message(buf.to_vec());
    }

    for _ in paths {
        let Some(reply) = driver.next_reply(Duration::from_secs(5)) else {
            break;
        };
        let (header, body) = decode_reply(&reply.bytes)?;
        println!(
            "message {} -> status {:#010x}, {} byte(s)",
            header.message_id,
            body.status as u32,
            body.payload.len()
        );
    }

    client.disconnect()?;
    println!("final state {}", client.state());
    Ok(())
}
