//! HTTP channel whose destination is resolved per call.

use std::sync::Arc;

use async_trait::async_trait;
use tether_proto::{RpcRequest, RpcResponse};
use tokio::net::TcpStream;

use super::http::{build_request, exchange, handshake};
use super::{CallDeadline, Channel};
use crate::error::RpcError;
use crate::routing::RoutingTable;

/// Routes each call by its request id through a [`RoutingTable`].
///
/// Every call dials the first live host of the resolved cluster and carries
/// one HTTP exchange over that connection.
#[derive(Debug)]
pub struct RoutedChannel {
    routing: Arc<dyn RoutingTable>,
}

impl RoutedChannel {
    pub fn new(routing: Arc<dyn RoutingTable>) -> Self {
        Self { routing }
    }

    async fn resolve(&self, domain: &str) -> Result<String, RpcError> {
        let cluster = self
            .routing
            .cluster_for(domain)
            .await
            .ok_or_else(|| RpcError::NoRoute(domain.to_owned()))?;
        let hosts = self.routing.hosts(&cluster).await;
        hosts.into_iter().next().ok_or(RpcError::NoHost(cluster))
    }
}

#[async_trait]
impl Channel for RoutedChannel {
    async fn call(&self, req: RpcRequest) -> Result<RpcResponse, RpcError> {
        let deadline = CallDeadline::for_request(&req);
        deadline
            .run(async move {
                let host = self.resolve(&req.id).await?;
                tracing::debug!(domain = %req.id, host = %host, "routing call");
                let request = build_request(req)?;

                let stream = TcpStream::connect(&host)
                    .await
                    .map_err(|e| RpcError::ConnectionFailed(format!("{host}: {e}")))?;
                let mut sender = handshake(stream).await?;
                exchange(&mut sender, request).await
            })
            .await
    }
}
