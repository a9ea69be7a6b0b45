use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Command header: type code (4) + data length (4) = 8 bytes.
pub const COMMAND_HEADER_SIZE: usize = 8;

/// Notification header: message id (4) + type (4) + data length (4) +
/// reply capacity (4) = 16 bytes.
pub const NOTIFICATION_HEADER_SIZE: usize = 16;

/// Reply header: message id (4) + status (4) = 8 bytes.
pub const REPLY_HEADER_SIZE: usize = 8;

/// Default maximum notification payload: 64 KiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

fn read_i32(src: &[u8], at: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&src[at..at + 4]);
    i32::from_le_bytes(raw)
}

fn length_field(field: &'static str, value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| WireError::NegativeLength { field, value })
}

fn wire_length(size: usize) -> Result<i32> {
    i32::try_from(size).map_err(|_| WireError::PayloadTooLarge {
        size,
        max: i32::MAX as usize,
    })
}

/// A request sent to the extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Extension-defined command code.
    pub type_code: i32,
    /// Opaque command data. May be empty.
    pub payload: Bytes,
}

impl Command {
    /// Create a new command.
    pub fn new(type_code: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            type_code,
            payload: payload.into(),
        }
    }

    /// A command with no data.
    pub fn empty(type_code: i32) -> Self {
        Self::new(type_code, Bytes::new())
    }

    /// The total wire size of this command (header + data).
    pub fn wire_size(&self) -> usize {
        COMMAND_HEADER_SIZE + self.payload.len()
    }
}

/// Encode a command into the wire format.
///
/// ```text
/// ┌───────────┬─────────────┬──────────────────────┐
/// │ Type (4B) │ Length (4B) │ Data (Length bytes)  │
/// └───────────┴─────────────┴──────────────────────┘
/// ```
pub fn encode_command(command: &Command, dst: &mut BytesMut) -> Result<()> {
    let length = wire_length(command.payload.len())?;
    dst.reserve(command.wire_size());
    dst.put_i32_le(command.type_code);
    dst.put_i32_le(length);
    dst.put_slice(&command.payload);
    Ok(())
}

/// Decode a command as received by the extension.
pub fn decode_command(src: &[u8], max_payload: usize) -> Result<Command> {
    if src.len() < COMMAND_HEADER_SIZE {
        return Err(WireError::Truncated {
            what: "command header",
            needed: COMMAND_HEADER_SIZE,
            available: src.len(),
        });
    }
    let type_code = read_i32(src, 0);
    let length = length_field("command data length", read_i32(src, 4))?;
    if length > max_payload {
        return Err(WireError::PayloadTooLarge {
            size: length,
            max: max_payload,
        });
    }
    let available = src.len() - COMMAND_HEADER_SIZE;
    if length > available {
        return Err(WireError::DataOverrun {
            declared: length,
            available,
        });
    }
    Ok(Command {
        type_code,
        payload: Bytes::copy_from_slice(&src[COMMAND_HEADER_SIZE..COMMAND_HEADER_SIZE + length]),
    })
}

/// Fixed header preceding every notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationHeader {
    pub message_id: i32,
    pub type_code: i32,
    pub data_length: i32,
    /// Bytes the extension reserved for the reply, header included.
    /// Zero means no reply is expected.
    pub reply_length: i32,
}

impl NotificationHeader {
    /// Parse the header from the front of `src`.
    pub fn parse(src: &[u8]) -> Result<Self> {
        if src.len() < NOTIFICATION_HEADER_SIZE {
            return Err(WireError::Truncated {
                what: "notification header",
                needed: NOTIFICATION_HEADER_SIZE,
                available: src.len(),
            });
        }
        Ok(Self {
            message_id: read_i32(src, 0),
            type_code: read_i32(src, 4),
            data_length: read_i32(src, 8),
            reply_length: read_i32(src, 12),
        })
    }

    fn put(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.message_id);
        dst.put_i32_le(self.type_code);
        dst.put_i32_le(self.data_length);
        dst.put_i32_le(self.reply_length);
    }
}

/// A notification pushed by the extension.
///
/// The payload borrows the buffer the notification was received into, so a
/// notification cannot outlive the dispatch that handed it out.
#[derive(Debug, Clone, Copy)]
pub struct Notification<'a> {
    header: NotificationHeader,
    reply_capacity: usize,
    payload: &'a [u8],
}

impl<'a> Notification<'a> {
    /// Parse a received notification.
    ///
    /// Negative lengths, data running past `src`, or data longer than
    /// `max_payload` are rejected.
    pub fn parse(src: &'a [u8], max_payload: usize) -> Result<Self> {
        let header = NotificationHeader::parse(src)?;
        let length = length_field("notification data length", header.data_length)?;
        let reply_capacity = length_field("reply length", header.reply_length)?;
        if length > max_payload {
            return Err(WireError::PayloadTooLarge {
                size: length,
                max: max_payload,
            });
        }
        let available = src.len() - NOTIFICATION_HEADER_SIZE;
        if length > available {
            return Err(WireError::DataOverrun {
                declared: length,
                available,
            });
        }
        Ok(Self {
            header,
            reply_capacity,
            payload: &src[NOTIFICATION_HEADER_SIZE..NOTIFICATION_HEADER_SIZE + length],
        })
    }

    pub fn header(&self) -> &NotificationHeader {
        &self.header
    }

    pub fn message_id(&self) -> i32 {
        self.header.message_id
    }

    pub fn type_code(&self) -> i32 {
        self.header.type_code
    }

    /// Reply capacity in bytes, header included.
    pub fn reply_capacity(&self) -> usize {
        self.reply_capacity
    }

    /// Whether the extension waits for a reply.
    pub fn expects_reply(&self) -> bool {
        self.reply_capacity > 0
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

/// Encode a notification as the extension would send it.
pub fn encode_notification(
    message_id: i32,
    type_code: i32,
    payload: &[u8],
    reply_capacity: usize,
    dst: &mut BytesMut,
) -> Result<()> {
    let header = NotificationHeader {
        message_id,
        type_code,
        data_length: wire_length(payload.len())?,
        reply_length: wire_length(reply_capacity)?,
    };
    dst.reserve(NOTIFICATION_HEADER_SIZE + payload.len());
    header.put(dst);
    dst.put_slice(payload);
    Ok(())
}

/// Fixed header preceding every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub message_id: i32,
    pub status: i32,
}

/// A handler's answer to a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationReply {
    /// Status reported to the extension. Zero is success.
    pub status: i32,
    pub payload: Bytes,
}

impl NotificationReply {
    /// A successful reply carrying `payload`.
    pub fn success(payload: impl Into<Bytes>) -> Self {
        Self {
            status: 0,
            payload: payload.into(),
        }
    }

    /// A payload-less reply carrying `status`.
    pub fn with_status(status: i32) -> Self {
        Self {
            status,
            payload: Bytes::new(),
        }
    }

    /// The total wire size of this reply (header + payload).
    pub fn wire_size(&self) -> usize {
        REPLY_HEADER_SIZE + self.payload.len()
    }
}

/// Encode a reply to `message_id`, bounded by the declared `capacity`.
///
/// A reply that does not fit is rejected, never truncated; `dst` is left
/// untouched in that case.
pub fn encode_reply(
    message_id: i32,
    reply: &NotificationReply,
    capacity: usize,
    dst: &mut BytesMut,
) -> Result<()> {
    let size = reply.wire_size();
    if size > capacity {
        return Err(WireError::ReplyTooLarge { size, capacity });
    }
    dst.reserve(size);
    dst.put_i32_le(message_id);
    dst.put_i32_le(reply.status);
    dst.put_slice(&reply.payload);
    Ok(())
}

/// Decode a reply as received by the extension.
pub fn decode_reply(src: &[u8]) -> Result<(ReplyHeader, NotificationReply)> {
    if src.len() < REPLY_HEADER_SIZE {
        return Err(WireError::Truncated {
            what: "reply header",
            needed: REPLY_HEADER_SIZE,
            available: src.len(),
        });
    }
    let header = ReplyHeader {
        message_id: read_i32(src, 0),
        status: read_i32(src, 4),
    };
    let reply = NotificationReply {
        status: header.status,
        payload: Bytes::copy_from_slice(&src[REPLY_HEADER_SIZE..]),
    };
    Ok((header, reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: &[u8]) {
        let command = Command::new(7, payload.to_vec());
        let mut buf = BytesMut::new();
        encode_command(&command, &mut buf).unwrap();
        assert_eq!(buf.len(), COMMAND_HEADER_SIZE + payload.len());

        let decoded = decode_command(&buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn command_roundtrip_boundary_payloads() {
        roundtrip(b"");
        roundtrip(b"x");
        roundtrip(&vec![0xA5; DEFAULT_MAX_PAYLOAD]);
    }

    #[test]
    fn command_header_layout_is_little_endian() {
        let mut buf = BytesMut::new();
        encode_command(&Command::new(0x0102_0304, &b"ab"[..]), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x04, 0x03, 0x02, 0x01, 2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn decode_command_rejects_negative_length() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1i32.to_le_bytes());
        raw.extend_from_slice(&(-1i32).to_le_bytes());
        let err = decode_command(&raw, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, WireError::NegativeLength { value: -1, .. }));
    }

    #[test]
    fn decode_command_rejects_overrun() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1i32.to_le_bytes());
        raw.extend_from_slice(&10i32.to_le_bytes());
        raw.extend_from_slice(b"short");
        let err = decode_command(&raw, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(
            err,
            WireError::DataOverrun {
                declared: 10,
                available: 5
            }
        ));
    }

    #[test]
    fn decode_command_needs_full_header() {
        let err = decode_command(&[0u8; 5], DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, WireError::Truncated { available: 5, .. }));
    }

    #[test]
    fn notification_parses_header_and_payload() {
        let mut buf = BytesMut::new();
        encode_notification(9, 3, b"payload", 20, &mut buf).unwrap();

        let note = Notification::parse(&buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(note.message_id(), 9);
        assert_eq!(note.type_code(), 3);
        assert_eq!(note.reply_capacity(), 20);
        assert!(note.expects_reply());
        assert_eq!(note.payload(), b"payload");
    }

    #[test]
    fn notification_with_zero_capacity_expects_no_reply() {
        let mut buf = BytesMut::new();
        encode_notification(1, 1, b"", 0, &mut buf).unwrap();
        let note = Notification::parse(&buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(!note.expects_reply());
        assert!(note.payload().is_empty());
    }

    #[test]
    fn notification_over_max_payload_is_rejected() {
        let mut buf = BytesMut::new();
        encode_notification(1, 1, &[0u8; 32], 0, &mut buf).unwrap();
        let err = Notification::parse(&buf, 16).unwrap_err();
        assert!(matches!(err, WireError::PayloadTooLarge { size: 32, max: 16 }));
    }

    #[test]
    fn notification_with_negative_reply_length_is_rejected() {
        let mut raw = Vec::new();
        for v in [1i32, 1, 0, -8] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let err = Notification::parse(&raw, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, WireError::NegativeLength { value: -8, .. }));
    }

    #[test]
    fn reply_fitting_exactly_is_encoded() {
        let reply = NotificationReply::success(vec![1, 2, 3, 4]);
        let mut buf = BytesMut::new();
        encode_reply(5, &reply, 12, &mut buf).unwrap();
        assert_eq!(buf.len(), 12);

        let (header, decoded) = decode_reply(&buf).unwrap();
        assert_eq!(header, ReplyHeader { message_id: 5, status: 0 });
        assert_eq!(decoded, reply);
    }

    #[test]
    fn oversized_reply_is_rejected_untouched() {
        let reply = NotificationReply::success(vec![0u8; 5]);
        let mut buf = BytesMut::new();
        let err = encode_reply(5, &reply, 12, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            WireError::ReplyTooLarge {
                size: 13,
                capacity: 12
            }
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn status_only_reply() {
        let mut buf = BytesMut::new();
        encode_reply(2, &NotificationReply::with_status(-1), 8, &mut buf).unwrap();
        let (header, reply) = decode_reply(&buf).unwrap();
        assert_eq!(header.status, -1);
        assert!(reply.payload.is_empty());
    }
}
