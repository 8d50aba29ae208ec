//! Channels: strategies for carrying one RPC exchange over a transport.

mod http;
mod multiplexed;
mod registry;
mod routed;

pub use self::http::HttpChannel;
pub use self::multiplexed::MultiplexedChannel;
pub use self::registry::{ChannelContext, ChannelFactory, ChannelRegistry};
pub use self::routed::RoutedChannel;

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether_proto::{ProtocolConfig, RpcRequest, RpcResponse};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;

/// Performs RPC exchanges.
#[async_trait]
pub trait Channel: Send + Sync + std::fmt::Debug {
    /// Sends `req` and waits for its response.
    ///
    /// `req.timeout_ms` must already be resolved to a non-zero value.
    async fn call(&self, req: RpcRequest) -> Result<RpcResponse, RpcError>;
}

/// Configuration of one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Registered channel name, usually the wire protocol.
    pub protocol: String,

    /// Listener the accept hook routes connections to, or a `host:port`.
    #[serde(default)]
    pub listener: String,

    /// Connection pool capacity for pool-backed channels. The multiplexed
    /// channel always shares one connection.
    #[serde(default)]
    pub size: usize,

    /// Protocol-specific settings.
    #[serde(default)]
    pub ext: ProtocolConfig,
}

impl ChannelConfig {
    pub fn new(protocol: impl Into<String>, listener: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            listener: listener.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn with_ext(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.ext.insert(key.into(), value.into());
        self
    }

    /// Pool capacity, treating zero as one.
    pub fn pool_size(&self) -> usize {
        self.size.max(1)
    }
}

/// Absolute deadline of one call, together with the caller's cancellation.
#[derive(Debug, Clone)]
pub struct CallDeadline {
    pub at: Instant,
    pub cancel: CancellationToken,
}

impl CallDeadline {
    pub fn for_request(req: &RpcRequest) -> Self {
        Self {
            at: Instant::now() + req.timeout(),
            cancel: req.cancel.clone(),
        }
    }

    /// Runs `fut` until it finishes, the deadline passes or the caller
    /// cancels. The last two give [`RpcError::Timeout`].
    pub async fn run<F, T>(&self, fut: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, RpcError>>,
    {
        tokio::select! {
            result = fut => result,
            () = tokio::time::sleep_until(self.at) => Err(RpcError::Timeout),
            () = self.cancel.cancelled() => Err(RpcError::Timeout),
        }
    }
}
