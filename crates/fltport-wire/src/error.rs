/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Fewer bytes than a fixed header requires.
    #[error("truncated {what} ({available} bytes, need {needed})")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    /// A length field carried a negative value.
    #[error("negative {field} ({value})")]
    NegativeLength { field: &'static str, value: i32 },

    /// Declared data runs past the received bytes.
    #[error("declared data length {declared} exceeds the {available} bytes received")]
    DataOverrun { declared: usize, available: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The marshaled reply does not fit the capacity the extension declared.
    #[error("reply of {size} bytes exceeds declared capacity {capacity}")]
    ReplyTooLarge { size: usize, capacity: usize },

    /// A fixed-size response came back with the wrong length.
    #[error("response size mismatch (expected {expected} bytes, got {actual})")]
    ResponseSize { expected: usize, actual: usize },

    /// A UTF-16 string payload was malformed.
    #[error("invalid UTF-16 string: {0}")]
    InvalidString(&'static str),
}

pub type Result<T> = std::result::Result<T, WireError>;
