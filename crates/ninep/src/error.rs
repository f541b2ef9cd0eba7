//! 9P client error representations.
//!
//! Every failure an operation can report falls in one of these groups:
//!
//! * encode errors: a value cannot be represented on the wire
//! * decode errors: a malformed, truncated or mistyped message
//! * remote errors: the server answered with `RError`
//! * transport errors: the connection is gone and every pending request fails with it
//! * handshake errors: version, msize or authentication problems during dial/attach
//! * cancellation: the caller's [`Context`](crate::context::Context) fired

use std::io;

use crate::fcall::MsgType;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value is out of range for its wire representation
    #[error("encode: {0}")]
    Encode(String),

    /// A message body could not be decoded
    #[error("decode: {0}")]
    Decode(String),

    /// A message of the wrong type arrived
    #[error("unexpected message: expected {expected:?}, got type {got}")]
    UnexpectedMessage { expected: MsgType, got: u8 },

    /// The server answered with `RError`
    #[error("{0}")]
    Remote(String),

    /// Read/write failure on the underlying stream
    #[error("transport: {0}")]
    Io(#[from] io::Error),

    /// The dispatch loop has terminated; the connection is unusable
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("version mismatch: wanted {want:?}, server offered {got:?}")]
    VersionMismatch { want: String, got: String },

    #[error("server msize {got} exceeds the requested {offered}")]
    MsizeTooLarge { offered: u32, got: u32 },

    #[error("authentication: {0}")]
    Auth(String),

    #[error("request canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("no free fids")]
    FidsExhausted,

    #[error("invalid path {0:?}")]
    InvalidPath(String),

    #[error("file does not exist: {0}")]
    NotFound(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error leaves the connection unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionClosed(_))
    }

    /// The server's error string, if this is a remote error
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Error::Remote(ename) => Some(ename),
            _ => None,
        }
    }

    pub(crate) fn decode(e: impl std::fmt::Display) -> Error {
        Error::Decode(e.to_string())
    }
}
