//! Errors from the wire format layer.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Unknown frame kind: {0:#04x}")]
    UnknownKind(u8),
    #[error("Truncated {kind} frame: need {needed} bytes, have {got}")]
    Truncated {
        kind: &'static str,
        needed: usize,
        got: usize,
    },
    #[error("Unexpected trailing bytes in {0} frame")]
    TrailingBytes(&'static str),
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("Method name too long: {len} bytes (max {max})")]
    MethodTooLong { len: usize, max: usize },
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
}
