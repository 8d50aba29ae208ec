//! In-memory remotes for channel tests.
//!
//! Both servers react to magic payloads: `close` drops the connection,
//! `timeout` delays the reply by two seconds and `deformity` answers with
//! bytes no codec can parse. Anything else is echoed back with its headers.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tether_proto::bolt::{self, Bolt};
use tether_proto::dubbo::{self, Dubbo};
use tether_proto::{Frame, TransportProtocol};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::bridge::{AcceptHook, BoxConnection};
use crate::error::RpcError;

/// Delay applied to `timeout` payloads.
pub const SLOW_REPLY: Duration = Duration::from_secs(2);

/// Bytes that fail to decode under every codec.
pub const GARBAGE: &[u8] = b"\xff\xffdeformity";

/// Accept hook serving a binary RPC protocol from memory.
#[derive(Debug)]
pub struct ProtocolEchoServer {
    listener: String,
    codec: Arc<dyn TransportProtocol>,
    ok_status: u16,
    accepted: AtomicUsize,
    log: Arc<ServerLog>,
}

/// What a frame server saw from its clients.
#[derive(Debug, Default)]
struct ServerLog {
    requests: Mutex<Vec<Frame>>,
    hangups: AtomicUsize,
}

impl ProtocolEchoServer {
    pub fn bolt(listener: &str) -> Self {
        Self::new(listener, Arc::new(Bolt::v1()), bolt::status::SUCCESS)
    }

    pub fn boltv2(listener: &str) -> Self {
        Self::new(listener, Arc::new(Bolt::v2()), bolt::status::SUCCESS)
    }

    pub fn dubbo(listener: &str) -> Self {
        Self::new(listener, Arc::new(Dubbo::new()), dubbo::STATUS_OK)
    }

    fn new(listener: &str, codec: Arc<dyn TransportProtocol>, ok_status: u16) -> Self {
        Self {
            listener: listener.to_owned(),
            codec,
            ok_status,
            accepted: AtomicUsize::new(0),
            log: Arc::default(),
        }
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Every request frame decoded so far, in arrival order.
    pub fn requests(&self) -> Vec<Frame> {
        self.log.requests.lock().clone()
    }

    /// Number of connections the client side closed.
    pub fn hangups(&self) -> usize {
        self.log.hangups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AcceptHook for ProtocolEchoServer {
    async fn accept(&self, conn: BoxConnection, listener: &str) -> Result<(), RpcError> {
        if listener != self.listener {
            return Err(RpcError::Config(format!("no listener named {listener}")));
        }
        self.accepted.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve_frames(
            conn,
            Arc::clone(&self.codec),
            self.ok_status,
            Arc::clone(&self.log),
        ));
        Ok(())
    }
}

/// `None` hangs up the connection.
type Outbound = mpsc::UnboundedSender<Option<Bytes>>;

async fn serve_frames(
    conn: BoxConnection,
    codec: Arc<dyn TransportProtocol>,
    ok_status: u16,
    log: Arc<ServerLog>,
) {
    let (mut reader, mut writer) = tokio::io::split(conn);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut buf = BytesMut::new();

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                if !matches!(read, Ok(n) if n > 0) {
                    log.hangups.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                loop {
                    match codec.decode(&mut buf) {
                        Ok(Some(frame)) => {
                            log.requests.lock().push(frame.clone());
                            tokio::spawn(reply(Arc::clone(&codec), frame, ok_status, tx.clone()));
                        }
                        Ok(None) => break,
                        Err(_) => return,
                    }
                }
            }
            outbound = rx.recv() => match outbound {
                Some(Some(bytes)) => {
                    if writer.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                _ => return,
            }
        }
    }
}

async fn reply(codec: Arc<dyn TransportProtocol>, frame: Frame, ok_status: u16, tx: Outbound) {
    match &frame.body[..] {
        b"close" => {
            let _ = tx.send(None);
            return;
        }
        b"deformity" => {
            let _ = tx.send(Some(Bytes::from_static(GARBAGE)));
            return;
        }
        b"timeout" => tokio::time::sleep(SLOW_REPLY).await,
        _ => {}
    }

    let mut response = frame.reply(ok_status, frame.body.clone());
    response.headers.clone_from(&frame.headers);
    if let Ok(bytes) = codec.encode(&response) {
        let _ = tx.send(Some(bytes));
    }
}

/// Accept hook that keeps every connection open and never reads from it.
pub struct SilentServer {
    listener: String,
    held: Mutex<Vec<BoxConnection>>,
}

impl SilentServer {
    pub fn new(listener: &str) -> Self {
        Self {
            listener: listener.to_owned(),
            held: Mutex::new(Vec::new()),
        }
    }
}

impl fmt::Debug for SilentServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SilentServer")
            .field("listener", &self.listener)
            .field("held", &self.held.lock().len())
            .finish()
    }
}

#[async_trait]
impl AcceptHook for SilentServer {
    async fn accept(&self, conn: BoxConnection, listener: &str) -> Result<(), RpcError> {
        if listener != self.listener {
            return Err(RpcError::Config(format!("no listener named {listener}")));
        }
        self.held.lock().push(conn);
        Ok(())
    }
}

/// Accept hook serving HTTP/1.1 from memory.
///
/// Echo responses carry the request body plus `x-method` and `x-uri`
/// headers, and copy every request header back. A `status` payload
/// answers `500` with body `boom`.
#[derive(Debug)]
pub struct HttpEchoServer {
    listener: String,
    accepted: AtomicUsize,
}

impl HttpEchoServer {
    pub fn new(listener: &str) -> Self {
        Self {
            listener: listener.to_owned(),
            accepted: AtomicUsize::new(0),
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AcceptHook for HttpEchoServer {
    async fn accept(&self, conn: BoxConnection, listener: &str) -> Result<(), RpcError> {
        if listener != self.listener {
            return Err(RpcError::Config(format!("no listener named {listener}")));
        }
        self.accepted.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(conn), service_fn(http_echo))
                .await;
        });
        Ok(())
    }
}

/// Echo handler shared by the in-memory and TCP HTTP test servers.
pub async fn http_echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, std::io::Error> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(std::io::Error::other)?
        .to_bytes();

    match &body[..] {
        b"close" => return Err(std::io::Error::other("hang up")),
        b"timeout" => tokio::time::sleep(SLOW_REPLY).await,
        b"status" => {
            return Ok(Response::builder()
                .status(500)
                .body(Full::new(Bytes::from_static(b"boom")))
                .map_err(std::io::Error::other)?)
        }
        _ => {}
    }

    let mut response = Response::builder()
        .header("x-method", parts.method.as_str())
        .header("x-uri", parts.uri.to_string());
    for (name, value) in &parts.headers {
        if name != hyper::header::CONTENT_LENGTH {
            response = response.header(name, value);
        }
    }
    response
        .body(Full::new(body))
        .map_err(std::io::Error::other)
}

/// Serves [`http_echo`] on a loopback TCP port, returning its address.
pub async fn spawn_tcp_http_echo() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("local address").to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(http_echo))
                    .await;
            });
        }
    });
    addr
}

/// Serves one binary protocol on a loopback TCP port, returning its address.
pub async fn spawn_tcp_bolt_echo() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("local address").to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_frames(
                Box::new(stream),
                Arc::new(Bolt::v1()),
                bolt::status::SUCCESS,
                Arc::default(),
            ));
        }
    });
    addr
}
