//! Error types for the wire codec and the connection dispatch core.
//!
//! The taxonomy mirrors how errors propagate: [`DecodeError`] and
//! [`ProtocolError`] are fatal to the connection that produced them,
//! [`RemoteError`] is local to a single pending call, and
//! [`DisconnectedError`] is what every pending call observes once the
//! connection leaves the connected state.

use thiserror::Error;

/// Ways a signature string can fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SigError {
    #[error("signature exceeds the maximum length")]
    TooLong,
    #[error("dict-entry key must be a base type")]
    NonBaseDictKey,
    #[error("arrays or structs nested too deep")]
    NestingTooDeep,
    #[error("unexpected closing parenthesis")]
    UnexpectedClosingParen,
    #[error("unexpected closing brace")]
    UnexpectedClosingBrace,
    #[error("dict entry may only appear as an array element")]
    DictEntryNotInArray,
    #[error("dict entry must contain exactly two types")]
    BadDictEntryArity,
    #[error("unknown type code {0:#04x}")]
    UnknownCode(u8),
    #[error("unclosed struct")]
    UnclosedStruct,
    #[error("unclosed dict entry")]
    UnclosedDictEntry,
    #[error("array with no element type")]
    ArrayWithNoType,
    #[error("expected a single complete type")]
    NotSingleType,
    #[error("signature must not be empty")]
    Empty,
}

/// A structural violation found while decoding a buffer.
///
/// Any of these invalidates the cursor of the reader that produced it, so
/// the owning connection must be torn down rather than resynchronized.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("buffer too short: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("non-zero padding byte {byte:#04x} at offset {offset}")]
    Padding { offset: usize, byte: u8 },
    #[error("boolean encoded as {0}, expected 0 or 1")]
    InvalidBool(u32),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("string missing NUL terminator")]
    MissingNul,
    #[error("array of declared length {declared} overran its end at offset {offset}")]
    ArrayOvershoot { declared: u32, offset: usize },
    #[error("array length {0} exceeds the maximum")]
    ArrayTooLong(u32),
    #[error("invalid signature: {0}")]
    Sig(#[from] SigError),
    #[error("invalid object path")]
    InvalidPath,
    #[error("message declares unknown type {0}")]
    InvalidMessageType(u8),
    #[error("invalid endianness marker {0:#04x}")]
    InvalidEndianness(u8),
    #[error("malformed header: {0}")]
    Header(&'static str),
    #[error("message length {0} exceeds the maximum")]
    MessageTooLong(u64),
    #[error("trailing bytes after the final value at offset {0}")]
    Trailing(usize),
    #[error("value nesting deeper than the maximum at offset {0}")]
    NestingTooDeep(usize),
}

/// A value was rejected before (or while) encoding it.
///
/// The writer rolls its buffer back to the last complete value, so a failed
/// encode never leaves partial bytes for the transport.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("array encoding would be {0} bytes, over the maximum")]
    ArrayTooLong(usize),
    #[error("invalid signature: {0}")]
    Sig(#[from] SigError),
    #[error("container element does not match the container's declared signature")]
    ElementMismatch,
    #[error("malformed header: {0}")]
    Header(&'static str),
    #[error("message length {0} exceeds the maximum")]
    MessageTooLong(u64),
}

/// The peer violated the message-level protocol.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("reply with serial {0} matches no outstanding call")]
    UnexpectedReply(u32),
    #[error("reply or error message carried no reply serial")]
    MissingReplySerial,
}

/// An Error message returned by the bus or a peer in response to a call.
///
/// Only the caller awaiting the corresponding serial observes this; other
/// pending calls are unaffected.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{name}: {}", message.as_deref().unwrap_or(""))]
pub struct RemoteError {
    /// The D-Bus error name, e.g. `org.freedesktop.DBus.Error.UnknownMethod`.
    pub name: String,
    /// Human-readable detail, when the error body carried one.
    pub message: Option<String>,
}

/// Why a connection left the connected state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DisconnectedError {
    /// The local owner called `disconnect` or dropped the connection.
    #[error("connection was disposed by its owner")]
    Disposed,
    /// The transport failed or the peer sent something unrecoverable.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Failure while establishing the logical connection (the Hello exchange).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectError {
    #[error("bus rejected the hello call: {0}")]
    Rejected(RemoteError),
    #[error("transport failed during connect: {0}")]
    Io(String),
    #[error("unexpected reply to the hello call")]
    BadHello,
}

/// Failure parsing a match rule from its textual bus syntax.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchRuleError {
    #[error("rule text exceeds the maximum length")]
    TooLong,
    #[error("malformed key='value' token at offset {0}")]
    Syntax(usize),
    #[error("argument match index {0} is out of range")]
    ArgIndex(u32),
    #[error("malformed argument match key {0:?}")]
    BadArgKey(String),
    #[error("unknown message type {0:?}")]
    BadType(String),
}

/// Umbrella error for every public connection operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Disconnected(#[from] DisconnectedError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    MatchRule(#[from] MatchRuleError),
    /// Programmer misuse detected synchronously at the call site.
    #[error("invalid use: {0}")]
    Usage(&'static str),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Disconnected(DisconnectedError::ConnectionLost(err.to_string()))
    }
}
