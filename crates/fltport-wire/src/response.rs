//! Fixed-size command responses.

use crate::error::{Result, WireError};

/// A response shape with a fixed wire size.
///
/// The extension writes exactly `WIRE_SIZE` bytes with no header; anything
/// else is a protocol error.
pub trait FixedResponse: Sized {
    const WIRE_SIZE: usize;

    /// Build the value from exactly `WIRE_SIZE` bytes.
    fn from_wire(bytes: &[u8]) -> Self;
}

macro_rules! fixed_int {
    ($($ty:ty),*) => {$(
        impl FixedResponse for $ty {
            const WIRE_SIZE: usize = std::mem::size_of::<$ty>();

            fn from_wire(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
        }
    )*};
}

fixed_int!(u8, i8, u16, i16, u32, i32, u64, i64);

impl<const N: usize> FixedResponse for [u8; N] {
    const WIRE_SIZE: usize = N;

    fn from_wire(bytes: &[u8]) -> Self {
        let mut raw = [0u8; N];
        raw.copy_from_slice(bytes);
        raw
    }
}

/// Decode a response, requiring exactly `R::WIRE_SIZE` bytes.
pub fn decode_response<R: FixedResponse>(bytes: &[u8]) -> Result<R> {
    if bytes.len() != R::WIRE_SIZE {
        return Err(WireError::ResponseSize {
            expected: R::WIRE_SIZE,
            actual: bytes.len(),
        });
    }
    Ok(R::from_wire(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Version {
        major: u16,
        minor: u16,
        build: u32,
    }

    impl FixedResponse for Version {
        const WIRE_SIZE: usize = 8;

        fn from_wire(bytes: &[u8]) -> Self {
            Self {
                major: u16::from_wire(&bytes[0..2]),
                minor: u16::from_wire(&bytes[2..4]),
                build: u32::from_wire(&bytes[4..8]),
            }
        }
    }

    #[test]
    fn decodes_integers_little_endian() {
        assert_eq!(decode_response::<u32>(&[1, 0, 0, 0]).unwrap(), 1);
        assert_eq!(decode_response::<i16>(&[0xFF, 0xFF]).unwrap(), -1);
    }

    #[test]
    fn decodes_user_struct() {
        let v: Version = decode_response(&[1, 0, 2, 0, 3, 0, 0, 0]).unwrap();
        assert_eq!(
            v,
            Version {
                major: 1,
                minor: 2,
                build: 3
            }
        );
    }

    #[test]
    fn byte_array_response() {
        let raw: [u8; 3] = decode_response(b"abc").unwrap();
        assert_eq!(&raw, b"abc");
    }

    #[test]
    fn wrong_size_is_rejected() {
        let err = decode_response::<u64>(&[0; 4]).unwrap_err();
        assert!(matches!(
            err,
            WireError::ResponseSize {
                expected: 8,
                actual: 4
            }
        ));
    }
}
