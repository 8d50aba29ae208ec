//! Protocol-independent request and response messages.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Header naming a `host:port` to dial directly, bypassing the shared connection.
pub const TARGET_ADDRESS: &str = "rpc_target_address";

/// Header overriding a zero request timeout, in milliseconds.
pub const REQUEST_TIMEOUT_MS: &str = "rpc_request_timeout";

/// Timeout applied when neither the request nor its headers carry one.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u32 = 3000;

/// Multimap of request or response headers.
///
/// Key order is irrelevant. Accessors that return a single value join all
/// values of a key with `,`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcHeader(HashMap<String, Vec<String>>);

impl RpcHeader {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all values of `key` joined by `,`, or an empty string.
    #[must_use]
    pub fn get(&self, key: &str) -> String {
        self.0.get(key).map(|v| v.join(",")).unwrap_or_default()
    }

    /// Returns the raw values of `key`.
    #[must_use]
    pub fn get_all(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Appends a value to `key`.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// Replaces all values of `key` with `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), vec![value.into()]);
    }

    /// Removes `key`, returning its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Visits every key with its joined value until `f` returns `false`.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        for (key, values) in &self.0 {
            if !f(key, &values.join(",")) {
                break;
            }
        }
    }

    /// Iterates over `(key, joined value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, String)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.join(",")))
    }
}

impl<K, V> FromIterator<(K, V)> for RpcHeader
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = Self::new();
        for (k, v) in iter {
            header.append(k, v);
        }
        header
    }
}

/// An outbound RPC request.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Caller-supplied request identifier (also the routing key for routed channels).
    pub id: String,
    /// Target method (the URI path for HTTP channels).
    pub method: String,
    pub content_type: String,
    pub header: RpcHeader,
    pub data: Bytes,
    /// Timeout in milliseconds; zero means "not set".
    pub timeout_ms: u32,
    /// Cancelled by the caller to abandon the call.
    pub cancel: CancellationToken,
}

impl RpcRequest {
    /// Creates a request with no headers and no timeout.
    pub fn new(id: impl Into<String>, method: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            content_type: String::new(),
            header: RpcHeader::new(),
            data: data.into(),
            timeout_ms: 0,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.append(key, value);
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// The request timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms as u64)
    }
}

/// A failure reported by the remote side inside an otherwise well-formed response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    /// Protocol-specific status code.
    pub status: u16,
    pub message: String,
}

/// An RPC response.
#[derive(Debug, Clone, Default)]
pub struct RpcResponse {
    pub header: RpcHeader,
    pub content_type: String,
    pub data: Bytes,
    /// Whether the remote reported success.
    pub success: bool,
    /// Populated when the remote reported a failure status.
    pub error: Option<RemoteError>,
}
