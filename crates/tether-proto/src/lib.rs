//! Wire protocol codecs for tether.
//!
//! This crate turns protocol-independent [`RpcRequest`]s into frames of a
//! concrete binary RPC protocol and turns response frames back into
//! [`RpcResponse`]s. It supports:
//!
//! - SOFA bolt v1 and v2 (`bolt`, `boltv2`)
//! - Dubbo (`dubbo`)
//!
//! Codecs are looked up by name through a [`ProtocolRegistry`]; decoding is
//! incremental so callers can feed a growing read buffer.
//!
//! # Example
//!
//! ```ignore
//! use tether_proto::{ProtocolRegistry, RpcRequest};
//!
//! let registry = ProtocolRegistry::with_defaults();
//! let dubbo = registry.get("dubbo").expect("registered");
//! let mut frame = dubbo.to_frame(&RpcRequest::new("1", "Call", body));
//! frame.request_id = 1;
//! let wire = dubbo.encode(&frame)?;
//! ```

pub mod bolt;
pub mod codec;
pub mod dubbo;
mod error;
pub mod hessian;
mod message;
mod registry;

pub use codec::{Frame, FrameKind, ProtocolConfig, TransportProtocol, MAX_MESSAGE_SIZE};
pub use error::ProtocolError;
pub use message::{
    RemoteError, RpcHeader, RpcRequest, RpcResponse, DEFAULT_REQUEST_TIMEOUT_MS,
    REQUEST_TIMEOUT_MS, TARGET_ADDRESS,
};
pub use registry::{ProtocolFactory, ProtocolRegistry};
