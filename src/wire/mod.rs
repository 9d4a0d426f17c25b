//! The DBus binary wire format: signatures, the value model, and the
//! reader/writer pair that move values in and out of byte buffers.

use std::ops::{Add, Rem, Sub};

pub mod reader;
pub mod signature;
pub mod value;
pub mod writer;

pub use reader::Reader;
pub use signature::Signature;
pub use value::Value;
pub use writer::Writer;

use crate::error::DecodeError;

/// Maximum length of a signature in bytes.
pub const MAX_SIGNATURE_LEN: usize = 128;
/// Maximum encoded byte length of a single array or dict.
pub const MAX_ARRAY_LEN: u32 = 1 << 26;
/// Maximum length of a complete message (header and body).
pub const MAX_MESSAGE_LEN: u64 = 1 << 27;
/// Maximum container nesting of a decoded value, variants included.
pub const MAX_NESTING_DEPTH: usize = 64;
/// Maximum length of a match rule's textual form.
pub const MAX_MATCH_RULE_LEN: usize = 1024;
/// Highest argument index a match rule may test.
pub const MAX_MATCH_ARG: u32 = 63;

/// Declared endianness of an encoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    pub const fn marker(self) -> u8 {
        match self {
            ByteOrder::LittleEndian => b'l',
            ByteOrder::BigEndian => b'B',
        }
    }
    pub fn from_marker(b: u8) -> Result<Self, DecodeError> {
        match b {
            b'l' => Ok(ByteOrder::LittleEndian),
            b'B' => Ok(ByteOrder::BigEndian),
            _ => Err(DecodeError::InvalidEndianness(b)),
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::LittleEndian
    }
}

/// Rounds `num` up to the next multiple of `alignment`.
pub fn align_num<T>(num: T, alignment: T) -> T
where
    T: Rem<T, Output = T> + Sub<T, Output = T> + Add<T, Output = T> + Copy,
{
    (alignment - (num % alignment)) % alignment + num
}
