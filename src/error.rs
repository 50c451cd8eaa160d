//! Crate-wide error taxonomy.
//!
//! None of these variants are ever serialized onto the wire: a failed
//! command always produces the same `{i, incomplete: true}` shape (see
//! `commands`). `HostError` exists for logging and for the handful of
//! failures (framing, parse) that terminate or silently drop instead.

use std::io;

/// Failure parsing a byte slice as JSON.
#[derive(Debug, thiserror::Error)]
pub enum JsonError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },
    #[error("invalid UTF-8 in string literal")]
    InvalidUtf8,
    #[error("control byte {byte:#04x} in unescaped string")]
    ControlByteInString { byte: u8 },
    #[error("unsupported escape sequence \\{0}")]
    UnsupportedEscape(char),
    #[error("malformed number literal")]
    MalformedNumber,
    #[error("trailing data after top-level value")]
    TrailingData,
}

/// Top-level error type for the host process.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("JSON error: {0}")]
    Json(#[from] JsonError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    #[error("startup validation failed: {0}")]
    StartupValidation(String),
}

pub type Result<T, E = HostError> = std::result::Result<T, E>;
