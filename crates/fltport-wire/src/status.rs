//! Well-known status codes exchanged with the extension.
//!
//! Values are `NTSTATUS` codes; replies carry them in the status field.

pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_UNSUCCESSFUL: i32 = 0xC000_0001_u32 as i32;
pub const STATUS_NOT_SUPPORTED: i32 = 0xC000_00BB_u32 as i32;
pub const STATUS_INVALID_PARAMETER: i32 = 0xC000_000D_u32 as i32;
pub const STATUS_ACCESS_DENIED: i32 = 0xC000_0022_u32 as i32;
pub const STATUS_BUFFER_TOO_SMALL: i32 = 0xC000_0023_u32 as i32;

/// Human-readable name for a well-known status code.
pub fn status_name(status: i32) -> Option<&'static str> {
    match status {
        STATUS_SUCCESS => Some("STATUS_SUCCESS"),
        STATUS_UNSUCCESSFUL => Some("STATUS_UNSUCCESSFUL"),
        STATUS_NOT_SUPPORTED => Some("STATUS_NOT_SUPPORTED"),
        STATUS_INVALID_PARAMETER => Some("STATUS_INVALID_PARAMETER"),
        STATUS_ACCESS_DENIED => Some("STATUS_ACCESS_DENIED"),
        STATUS_BUFFER_TOO_SMALL => Some("STATUS_BUFFER_TOO_SMALL"),
        _ => None,
    }
}
