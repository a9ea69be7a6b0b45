//! Binary wire codec for the file-system extension channel.
//!
//! Every integer is a little-endian `i32`:
//! - commands: type code, data length, data
//! - notifications: message id, type, data length, reply capacity, data
//! - replies: message id, status, payload
//!
//! Command responses carry no header; the caller declares a fixed-size
//! shape through [`FixedResponse`].

pub mod codec;
pub mod error;
pub mod response;
pub mod status;
pub mod string;

pub use codec::{
    decode_command, decode_reply, encode_command, encode_notification, encode_reply, Command,
    Notification, NotificationHeader, NotificationReply, ReplyHeader, COMMAND_HEADER_SIZE,
    DEFAULT_MAX_PAYLOAD, NOTIFICATION_HEADER_SIZE, REPLY_HEADER_SIZE,
};
pub use error::{Result, WireError};
pub use response::{decode_response, FixedResponse};
pub use status::{
    status_name, STATUS_ACCESS_DENIED, STATUS_BUFFER_TOO_SMALL, STATUS_INVALID_PARAMETER,
    STATUS_NOT_SUPPORTED, STATUS_SUCCESS, STATUS_UNSUCCESSFUL,
};
pub use string::{decode_utf16z, encode_utf16z};
