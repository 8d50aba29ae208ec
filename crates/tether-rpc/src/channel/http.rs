//! Pool-backed HTTP/1.1 channel.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tether_proto::{RpcHeader, RpcRequest, RpcResponse};

use super::{CallDeadline, Channel, ChannelConfig, ChannelContext};
use crate::bridge::{self, AcceptHook, Connection};
use crate::error::RpcError;
use crate::pool::{ConnPool, Dialed, Dialer};

/// Header carrying the HTTP method.
pub const VERB_HEADER: &str = "verb";

/// Header carrying the raw query string.
pub const QUERY_HEADER: &str = "query_string";

/// Longest body excerpt kept in an [`RpcError::HttpStatus`].
const BODY_EXCERPT_LEN: usize = 512;

type Sender = http1::SendRequest<Full<Bytes>>;

struct HttpDialer {
    listener: String,
    hook: Arc<dyn AcceptHook>,
}

#[async_trait]
impl Dialer<Sender> for HttpDialer {
    async fn dial(&self) -> Result<Dialed<Sender>, RpcError> {
        let stream = bridge::connect(&*self.hook, &self.listener).await?;
        let sender = handshake(stream).await?;
        tracing::debug!(listener = %self.listener, "http connection established");
        Ok(Dialed::new(sender))
    }
}

/// Performs the HTTP/1.1 handshake and spawns the connection driver.
pub(super) async fn handshake(stream: impl Connection) -> Result<Sender, RpcError> {
    let (sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| RpcError::ConnectionFailed(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "http connection closed with error");
        }
    });
    Ok(sender)
}

/// Sends one request and reads the whole response.
pub(super) async fn exchange(
    sender: &mut Sender,
    request: Request<Full<Bytes>>,
) -> Result<RpcResponse, RpcError> {
    sender
        .ready()
        .await
        .map_err(|e| RpcError::Unavailable(e.to_string()))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| RpcError::Unavailable(e.to_string()))?;

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| RpcError::Unavailable(e.to_string()))?
        .to_bytes();

    if parts.status != StatusCode::OK {
        let excerpt = &body[..body.len().min(BODY_EXCERPT_LEN)];
        return Err(RpcError::HttpStatus {
            status: parts.status.as_u16(),
            body: String::from_utf8_lossy(excerpt).into_owned(),
        });
    }

    let mut header = RpcHeader::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            header.append(name.as_str(), value);
        }
    }
    let content_type = header.get(CONTENT_TYPE.as_str());

    Ok(RpcResponse {
        header,
        content_type,
        data: body,
        success: true,
        error: None,
    })
}

/// Maps an RPC request onto an HTTP request.
///
/// The method comes from the `verb` header (default `GET`), the path from
/// `req.method` and the query from the `query_string` header. Both headers
/// are consumed; every other header is copied.
pub(super) fn build_request(mut req: RpcRequest) -> Result<Request<Full<Bytes>>, RpcError> {
    let verb = req
        .header
        .remove(VERB_HEADER)
        .map(|values| values.join(","))
        .filter(|v| !v.is_empty());
    let method = match verb {
        Some(verb) => Method::from_bytes(verb.as_bytes())
            .map_err(|_| RpcError::Config(format!("invalid http method {verb}")))?,
        None => Method::GET,
    };

    let mut uri = if req.method.starts_with('/') {
        req.method.clone()
    } else {
        format!("/{}", req.method)
    };
    let query = req
        .header
        .remove(QUERY_HEADER)
        .map(|values| values.join(","))
        .unwrap_or_default();
    if !query.is_empty() {
        uri.push('?');
        uri.push_str(&query);
    }

    let mut request = Request::builder()
        .method(method)
        .uri(&uri)
        .body(Full::new(req.data))
        .map_err(|e| RpcError::Config(format!("invalid http request {uri}: {e}")))?;

    let headers = request.headers_mut();
    for (key, value) in req.header.iter() {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| RpcError::Config(format!("invalid header name {key}")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|_| RpcError::Config(format!("invalid value for header {key}")))?;
        headers.insert(name, value);
    }
    if !req.content_type.is_empty() && !headers.contains_key(CONTENT_TYPE) {
        let value = HeaderValue::from_str(&req.content_type)
            .map_err(|_| RpcError::Config("invalid content type".into()))?;
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(HOST, HeaderValue::from_static("localhost"));
    let id = HeaderValue::from_str(&req.id)
        .map_err(|_| RpcError::Config(format!("invalid request id {}", req.id)))?;
    headers.insert("id", id);

    Ok(request)
}

/// Channel issuing one HTTP exchange per call over pooled connections.
pub struct HttpChannel {
    listener: String,
    pool: ConnPool<Sender>,
}

impl HttpChannel {
    pub fn new(config: &ChannelConfig, ctx: &ChannelContext) -> Self {
        let dialer = HttpDialer {
            listener: config.listener.clone(),
            hook: Arc::clone(&ctx.accept_hook),
        };
        Self {
            listener: config.listener.clone(),
            pool: ConnPool::new(config.pool_size(), dialer),
        }
    }

    pub fn pool(&self) -> &ConnPool<Sender> {
        &self.pool
    }
}

#[async_trait]
impl Channel for HttpChannel {
    async fn call(&self, req: RpcRequest) -> Result<RpcResponse, RpcError> {
        let deadline = CallDeadline::for_request(&req);
        let request = build_request(req)?;

        let mut conn = self.pool.get(deadline.at, &deadline.cancel).await?;
        while conn.conn().is_closed() {
            // the server hung up while the connection sat idle
            self.pool.put(conn, true);
            conn = self.pool.get(deadline.at, &deadline.cancel).await?;
        }

        let result = deadline.run(exchange(conn.conn_mut(), request)).await;
        match &result {
            Ok(_) | Err(RpcError::HttpStatus { .. }) => self.pool.put(conn, false),
            Err(e) => {
                tracing::debug!(listener = %self.listener, error = %e, "discarding http connection");
                self.pool.put(conn, true);
            }
        }
        result
    }
}

impl fmt::Debug for HttpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpChannel")
            .field("listener", &self.listener)
            .field("pool", &self.pool)
            .finish()
    }
}
