//! The closed error taxonomy for the decoder.
//!
//! Every fallible operation in this crate returns [`Error`]; there is no
//! `panic!`/`unwrap()` path reachable from attacker-controlled bytes.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file magic mismatch: expected PBDEMS2\\0")]
    MagicMismatch,

    #[error("corrupt packet: {0}")]
    CorruptPacket(&'static str),

    #[error("unknown field type {0:?}")]
    UnknownType(String),

    #[error("missing serializer {name:?} version {version}")]
    MissingSerializer { name: String, version: i32 },

    #[error("hash collision on field {0:?} within one table")]
    HashCollision(String),

    #[error("invalid field path: {0}")]
    InvalidFieldPath(&'static str),

    #[error("decompression failed: {0}")]
    DecompressError(&'static str),

    #[error("operation invalid in current state: {0}")]
    StateViolation(&'static str),

    #[error("seek target reached end of stream before gamerules entity appeared")]
    SeekNoGamerules,

    #[error("seek target is beyond the end of the stream")]
    SeekOverflow,
}

impl Error {
    pub fn corrupt(msg: &'static str) -> Error {
        Error::CorruptPacket(msg)
    }
}
