//! Error types for the wire codecs.

use thiserror::Error;

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The leading protocol byte (or magic) is not the one this codec speaks.
    #[error("unknown protocol code: {0:#x}")]
    UnknownProtocol(u16),

    /// Invalid frame header.
    #[error("invalid frame header: {0}")]
    InvalidFrameHeader(String),

    /// Frame too large.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A frame of the wrong kind was handed to the codec.
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    /// Malformed hessian2 data inside a frame body.
    #[error("invalid hessian data: {0}")]
    InvalidHessian(String),

    /// The codec's extension config is missing or malformed.
    #[error("{0}")]
    InvalidConfig(String),
}

impl ProtocolError {
    /// Returns a stable, snake-case name for this error.
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::UnknownProtocol(_) => "unknown_protocol",
            Self::InvalidFrameHeader(_) => "invalid_frame_header",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::UnexpectedFrame(_) => "unexpected_frame",
            Self::InvalidHessian(_) => "invalid_hessian",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}
