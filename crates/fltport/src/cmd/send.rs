use std::fs;

use bytes::Bytes;
use fltport_client::{ClientConfig, DriverClient};
use fltport_transport::FilterTransport;
use fltport_wire::{encode_utf16z, Command};

use crate::cmd::{native_transport, SendArgs};
use crate::exit::{client_error, io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_response, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = resolve_payload(&args)?;
    let transport = native_transport()?;
    let response = execute(transport, &args, payload)?;
    print_response(&args.port, args.type_code, &response, format);
    Ok(SUCCESS)
}

/// Connect with a single idle worker, run one command, disconnect.
pub(crate) fn execute<T: FilterTransport>(
    transport: T,
    args: &SendArgs,
    payload: Bytes,
) -> CliResult<Bytes> {
    let config = ClientConfig::new(args.port.clone()).with_worker_count(1);
    let client = DriverClient::new(transport, config);
    client
        .connect()
        .map_err(|err| client_error("connect failed", err))?;

    let command = Command::new(args.type_code, payload);
    let response = client
        .execute_raw(&command, args.response_size)
        .map_err(|err| client_error("command failed", err))?;

    client
        .disconnect()
        .map_err(|err| client_error("disconnect failed", err))?;
    Ok(response)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Bytes> {
    if let Some(data) = &args.data {
        return Ok(Bytes::copy_from_slice(data.as_bytes()));
    }
    if let Some(hex) = &args.hex {
        return parse_hex(hex).map(Bytes::from);
    }
    if let Some(text) = &args.utf16 {
        return Ok(encode_utf16z(text));
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map(Bytes::from)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Bytes::new())
}

fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();
    if digits.len() % 2 != 0 {
        return Err(CliError::new(USAGE, "--hex needs an even number of digits"));
    }
    digits
        .chunks_exact(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).unwrap_or("");
            u8::from_str_radix(text, 16)
                .map_err(|_| CliError::new(USAGE, format!("invalid hex byte: {text}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use fltport_transport::loopback;
    use fltport_wire::{decode_command, DEFAULT_MAX_PAYLOAD};

    use super::*;

    fn args(port: &str, response_size: usize) -> SendArgs {
        SendArgs {
            port: port.to_string(),
            type_code: 4,
            data: None,
            hex: None,
            utf16: None,
            file: None,
            response_size,
        }
    }

    #[test]
    fn parse_hex_accepts_separators() {
        assert_eq!(parse_hex("0a0B").unwrap(), vec![0x0a, 0x0b]);
        assert_eq!(parse_hex("de:ad be:ef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn utf16_payload_is_terminated() {
        let mut a = args("\\P", 0);
        a.utf16 = Some("C:".to_string());
        let payload = resolve_payload(&a).expect("payload should resolve");
        assert_eq!(&payload[..], &[b'C', 0, b':', 0, 0, 0]);
    }

    #[test]
    fn execute_round_trips_over_loopback() {
        let (transport, driver) = loopback("\\CliPort");
        driver.set_command_handler(|raw| {
            let command = decode_command(raw, DEFAULT_MAX_PAYLOAD).map_err(|_| -1)?;
            let mut answer = command.payload.to_vec();
            answer.reverse();
            Ok(answer)
        });

        let response = execute(transport, &args("\\CliPort", 3), Bytes::from_static(b"abc"))
            .expect("command should succeed");
        assert_eq!(&response[..], b"cba");
        assert_eq!(driver.stats().open_ports, 0);
    }

    #[test]
    fn execute_reports_missing_port() {
        let (transport, _driver) = loopback("\\CliPort");
        let err = execute(transport, &args("\\Other", 0), Bytes::new()).unwrap_err();
        assert_eq!(err.code, crate::exit::FAILURE);
    }
}
