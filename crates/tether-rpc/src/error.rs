//! RPC error types.

use tether_proto::ProtocolError;
use thiserror::Error;

/// Status class reported to the API layer, mirroring gRPC codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    DeadlineExceeded,
    Unavailable,
    Internal,
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("missing channel config")]
    MissingChannelConfig,

    #[error("channel {0} not found")]
    ChannelNotFound(String),

    #[error("protocol {0} not found")]
    ProtocolNotFound(String),

    #[error("connection pool timeout")]
    PoolTimeout,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("request timeout")]
    Timeout,

    #[error("connection closed by remote")]
    ConnectionClosed,

    #[error("no available service found: {0}")]
    NoRoute(String),

    #[error("no available server address: {0}")]
    NoHost(String),

    #[error("http response code {status}, body: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("Callback error: {0}")]
    Callback(String),

    #[error("invoker panic: {0}")]
    Panic(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::MissingChannelConfig => "missing_channel_config",
            Self::ChannelNotFound(_) => "channel_not_found",
            Self::ProtocolNotFound(_) => "protocol_not_found",
            Self::PoolTimeout => "pool_timeout",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::NoRoute(_) => "no_route",
            Self::NoHost(_) => "no_host",
            Self::HttpStatus { .. } => "http_status",
            Self::Protocol(_) => "protocol_error",
            Self::Json(_) => "invalid_json",
            Self::Callback(_) => "callback_error",
            Self::Panic(_) => "panic",
            Self::Io(_) => "io_error",
        }
    }

    pub const fn code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::MissingChannelConfig | Self::Json(_) => {
                StatusCode::InvalidArgument
            }
            Self::ChannelNotFound(_) | Self::ProtocolNotFound(_) | Self::NoRoute(_) => {
                StatusCode::NotFound
            }
            Self::PoolTimeout | Self::Timeout => StatusCode::DeadlineExceeded,
            Self::ConnectionFailed(_)
            | Self::Unavailable(_)
            | Self::ConnectionClosed
            | Self::NoHost(_)
            | Self::HttpStatus { .. }
            | Self::Io(_) => StatusCode::Unavailable,
            Self::Protocol(_) | Self::Callback(_) | Self::Panic(_) => StatusCode::Internal,
        }
    }

    /// Whether the caller may retry the same call as-is.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            StatusCode::DeadlineExceeded | StatusCode::Unavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(RpcError::Timeout.code(), StatusCode::DeadlineExceeded);
        assert_eq!(RpcError::PoolTimeout.code(), StatusCode::DeadlineExceeded);
        assert_eq!(RpcError::ConnectionClosed.code(), StatusCode::Unavailable);
        assert_eq!(
            RpcError::ChannelNotFound("fake".into()).code(),
            StatusCode::NotFound
        );
        assert_eq!(RpcError::Panic("boom".into()).code(), StatusCode::Internal);
    }

    #[test]
    fn error_types() {
        assert_eq!(RpcError::Timeout.error_type(), "timeout");
        assert_eq!(
            RpcError::HttpStatus {
                status: 500,
                body: String::new()
            }
            .error_type(),
            "http_status"
        );
    }

    #[test]
    fn configuration_messages() {
        assert_eq!(
            RpcError::ChannelNotFound("fake".into()).to_string(),
            "channel fake not found"
        );
        assert_eq!(
            RpcError::MissingChannelConfig.to_string(),
            "missing channel config"
        );
        assert!(!RpcError::MissingChannelConfig.is_retryable());
        assert!(RpcError::ConnectionClosed.is_retryable());
    }
}
