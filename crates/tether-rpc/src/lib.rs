//! RPC forwarding core of the tether sidecar.
//!
//! An [`Invoker`] takes a protocol-independent [`RpcRequest`], runs it
//! through its before-invoke callbacks, hands it to one of its channel
//! replicas and runs the response through its after-invoke callbacks.
//!
//! Channels carry the exchange over a transport:
//!
//! - [`MultiplexedChannel`](channel::MultiplexedChannel) keeps one connection
//!   per channel and interleaves binary RPC frames (`bolt`, `boltv2`, `dubbo`)
//!   by request id.
//! - [`HttpChannel`](channel::HttpChannel) pools HTTP/1.1 connections.
//! - [`RoutedChannel`](channel::RoutedChannel) resolves a service through a
//!   [`RoutingTable`](routing::RoutingTable) and dials it directly.
//!
//! Connections are opened through the [`bridge`], which hands an in-process
//! stream to the surrounding network stack or dials `host:port` listeners.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_rpc::bridge::TcpOnlyHook;
//! use tether_rpc::channel::ChannelContext;
//! use tether_rpc::{Invoker, InvokerContext, RpcRequest};
//!
//! let ctx = InvokerContext::new(ChannelContext::new(Arc::new(TcpOnlyHook)));
//! let invoker = Invoker::from_json(
//!     br#"{"channel":{"protocol":"http","listener":"127.0.0.1:8080"}}"#,
//!     &ctx,
//! )?;
//! let resp = invoker.invoke(RpcRequest::new("1", "", "hello")).await?;
//! ```

pub mod balancer;
pub mod bridge;
pub mod callback;
pub mod channel;
pub mod config;
mod error;
pub mod invoker;
pub mod pool;
pub mod routing;

#[cfg(test)]
pub mod testing;

pub use config::{ConfigError, TetherConfig};
pub use error::{RpcError, StatusCode};
pub use invoker::{Invoker, InvokerConfig, InvokerContext};
pub use tether_proto::{RemoteError, RpcHeader, RpcRequest, RpcResponse};
