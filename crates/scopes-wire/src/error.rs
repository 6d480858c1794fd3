//! Error types for the wire codec

use thiserror::Error;

/// Errors raised while encoding or decoding wire data
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unexpected end of frame")]
    UnexpectedEof,

    #[error("unknown variant tag: {0}")]
    UnknownTag(u8),

    #[error("unknown frame kind: {0}")]
    UnknownFrameKind(u8),

    #[error("unknown request mode: {0}")]
    UnknownRequestMode(u8),

    #[error("unknown response status: {0}")]
    UnknownStatus(u8),

    #[error("unknown exception kind: {0}")]
    UnknownExceptionKind(u8),

    #[error("wire version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("value nesting exceeds maximum depth {0}")]
    NestingTooDeep(usize),
}

pub type Result<T> = std::result::Result<T, WireError>;
