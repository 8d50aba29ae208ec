//! Transport bridge to the surrounding network stack.
//!
//! Channels never open sockets to the local proxy themselves. They create an
//! in-process duplex stream and hand the remote end to an [`AcceptHook`],
//! which behaves as if a client had just connected to the named listener.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::RpcError;

/// Buffer size of each direction of an in-process connection.
pub const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

/// A bidirectional byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed connection.
pub type BoxConnection = Box<dyn Connection>;

/// Entry point of the surrounding network stack.
#[async_trait]
pub trait AcceptHook: Send + Sync + fmt::Debug {
    /// Takes ownership of `conn` as a newly accepted connection on `listener`.
    async fn accept(&self, conn: BoxConnection, listener: &str) -> Result<(), RpcError>;
}

/// Accept hook for processes without an embedded network stack.
///
/// Every listener must be a `host:port` address, which [`connect`] dials
/// directly, so this hook only ever reports a configuration error.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpOnlyHook;

#[async_trait]
impl AcceptHook for TcpOnlyHook {
    async fn accept(&self, _conn: BoxConnection, listener: &str) -> Result<(), RpcError> {
        Err(RpcError::Config(format!(
            "listener {listener} is not a host:port address"
        )))
    }
}

/// Whether `listener` names a TCP endpoint rather than a listener.
pub fn is_host_port(listener: &str) -> bool {
    match listener.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Opens a connection to `listener`.
///
/// `host:port` listeners are dialed over TCP. Anything else is bridged
/// through `hook` with an in-process duplex stream.
pub async fn connect(hook: &dyn AcceptHook, listener: &str) -> Result<BoxConnection, RpcError> {
    if is_host_port(listener) {
        let stream = TcpStream::connect(listener)
            .await
            .map_err(|e| RpcError::ConnectionFailed(format!("{listener}: {e}")))?;
        stream.set_nodelay(true)?;
        return Ok(Box::new(stream));
    }

    let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
    hook.accept(Box::new(remote), listener).await?;
    tracing::debug!(listener, "bridged in-process connection");
    Ok(Box::new(local))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl AcceptHook for Echo {
        async fn accept(&self, mut conn: BoxConnection, listener: &str) -> Result<(), RpcError> {
            if listener != "egress" {
                return Err(RpcError::Config("invalid listener name".into()));
            }
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while let Ok(n) = conn.read(&mut buf).await {
                    if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
            Ok(())
        }
    }

    #[test]
    fn host_port_detection() {
        assert!(is_host_port("127.0.0.1:12220"));
        assert!(is_host_port("localhost:80"));
        assert!(!is_host_port("egress_runtime_http"));
        assert!(!is_host_port(":80"));
        assert!(!is_host_port("host:port"));
    }

    #[tokio::test]
    async fn bridges_through_hook() {
        let mut conn = connect(&Echo, "egress").await.unwrap();
        conn.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn hook_errors_propagate() {
        let err = connect(&Echo, "unknown").await.err().unwrap();
        assert!(matches!(err, RpcError::Config(_)));

        let err = connect(&TcpOnlyHook, "egress").await.err().unwrap();
        assert!(matches!(err, RpcError::Config(_)));
    }

    #[tokio::test]
    async fn dials_tcp_listeners() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let mut conn = connect(&TcpOnlyHook, &addr).await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
