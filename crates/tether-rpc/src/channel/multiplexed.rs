//! Channel that pipelines many requests over one shared connection.
//!
//! Every request gets a fresh id and a one-shot waiter in the pending
//! table. A background reader decodes response frames and hands each one to
//! the waiter registered under its id. Waiters also watch the deadline and
//! the connection's close notifier, so a dead connection never strands them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tether_proto::{Frame, RpcRequest, RpcResponse, TransportProtocol, TARGET_ADDRESS};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{CallDeadline, Channel, ChannelConfig, ChannelContext};
use crate::bridge::{self, AcceptHook, BoxConnection};
use crate::error::RpcError;

/// Attempts at getting a connection and writing one frame.
const WRITE_ATTEMPTS: usize = 4;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Why a shared connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// EOF or a read failure.
    Remote,
    /// The remote sent bytes the codec could not decode.
    Malformed,
    /// A local write failed.
    Broken,
}

/// One shared connection.
///
/// The write half is dropped on close so the remote sees EOF once the
/// reader exits.
struct MuxConn {
    id: u64,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxConnection>>>,
    closed: CancellationToken,
    reason: OnceLock<CloseReason>,
}

impl MuxConn {
    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Closes the connection. Only the first reason sticks.
    fn close(&self, reason: CloseReason) {
        if self.reason.set(reason).is_ok() {
            tracing::warn!(conn = self.id, ?reason, "multiplexed connection closed");
        }
        self.closed.cancel();
        // a writer holding the lock drops the half itself once it sees the close
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    /// The error reported to waiters stranded by the close.
    fn failure(&self) -> RpcError {
        match self.reason.get() {
            Some(CloseReason::Malformed) => RpcError::Timeout,
            _ => RpcError::ConnectionClosed,
        }
    }

    /// Writes one whole frame. Waiting for the write lock counts against
    /// the deadline; timing out after the first byte may have gone out
    /// closes the connection.
    async fn write(&self, wire: &[u8], deadline: Instant) -> Result<(), RpcError> {
        let writing = AtomicBool::new(false);
        let written = tokio::time::timeout_at(deadline, async {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(RpcError::ConnectionClosed);
            };
            writing.store(true, Ordering::Relaxed);
            let written = tokio::select! {
                written = async {
                    writer.write_all(wire).await?;
                    writer.flush().await
                } => Some(written),
                () = self.closed.cancelled() => None,
            };
            if self.is_closed() {
                guard.take();
            }
            match written {
                Some(Ok(())) => Ok(()),
                Some(Err(e)) => Err(RpcError::Unavailable(format!("write failed: {e}"))),
                None => Err(RpcError::ConnectionClosed),
            }
        })
        .await;

        match written {
            Ok(result) => result,
            Err(_) => {
                if writing.load(Ordering::Relaxed) {
                    // a partially written frame leaves the stream unusable
                    self.close(CloseReason::Broken);
                }
                Err(RpcError::Timeout)
            }
        }
    }
}

/// Waiters keyed by request id.
#[derive(Default)]
struct PendingTable {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Frame>>>,
}

impl PendingTable {
    fn register(self: &Arc<Self>, id: u64) -> (PendingGuard, oneshot::Receiver<Frame>) {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        waiters.insert(id, tx);
        tracing::trace!(request_id = id, pending = waiters.len(), "registered waiter");
        drop(waiters);
        let guard = PendingGuard {
            table: Arc::clone(self),
            id,
        };
        (guard, rx)
    }

    fn take(&self, id: u64) -> Option<oneshot::Sender<Frame>> {
        self.waiters.lock().remove(&id)
    }

    fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// Removes its waiter when the call finishes, whichever way it finishes.
struct PendingGuard {
    table: Arc<PendingTable>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.take(self.id);
    }
}

/// Channel for the `bolt`, `boltv2` and `dubbo` protocols.
pub struct MultiplexedChannel {
    listener: String,
    protocol: Arc<dyn TransportProtocol>,
    hook: Arc<dyn AcceptHook>,
    next_request_id: AtomicU32,
    next_conn_id: AtomicU64,
    conn: RwLock<Option<Arc<MuxConn>>>,
    pending: Arc<PendingTable>,
}

impl MultiplexedChannel {
    /// Builds a channel for `config.protocol`, initialising the codec with `config.ext`.
    pub fn new(config: &ChannelConfig, ctx: &ChannelContext) -> Result<Self, RpcError> {
        let mut protocol = ctx
            .protocols
            .get(&config.protocol)
            .ok_or_else(|| RpcError::ProtocolNotFound(config.protocol.clone()))?;
        protocol.init(&config.ext)?;

        Ok(Self {
            listener: config.listener.clone(),
            protocol: Arc::from(protocol),
            hook: Arc::clone(&ctx.accept_hook),
            next_request_id: AtomicU32::new(0),
            next_conn_id: AtomicU64::new(0),
            conn: RwLock::new(None),
            pending: Arc::new(PendingTable::default()),
        })
    }

    /// Number of calls currently waiting for a response.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Next request id. Ids wrap at `u32::MAX` and skip zero.
    fn next_request_id(&self) -> u64 {
        loop {
            let id = self
                .next_request_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id != 0 {
                return u64::from(id);
            }
        }
    }

    /// Returns the live shared connection, connecting if there is none.
    ///
    /// Lock waits and the dial both count against the call's deadline.
    async fn get_conn(&self, deadline: &CallDeadline) -> Result<Arc<MuxConn>, RpcError> {
        deadline
            .run(async {
                {
                    let current = self.conn.read().await;
                    if let Some(conn) = current.as_ref().filter(|c| !c.is_closed()) {
                        return Ok(Arc::clone(conn));
                    }
                }

                let mut current = self.conn.write().await;
                if let Some(conn) = current.as_ref().filter(|c| !c.is_closed()) {
                    return Ok(Arc::clone(conn));
                }

                let stream = bridge::connect(&*self.hook, &self.listener).await?;
                let conn = self.start(stream);
                *current = Some(Arc::clone(&conn));
                Ok(conn)
            })
            .await
    }

    fn start(&self, stream: BoxConnection) -> Arc<MuxConn> {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(MuxConn {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1,
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
            reason: OnceLock::new(),
        });
        tracing::debug!(
            conn = conn.id,
            listener = %self.listener,
            protocol = self.protocol.name(),
            "multiplexed connection established"
        );
        tokio::spawn(read_loop(
            reader,
            Arc::clone(&conn),
            Arc::clone(&self.protocol),
            Arc::clone(&self.pending),
        ));
        conn
    }

    /// Drops `stale` as the current connection unless it was already replaced.
    async fn destroy_conn(&self, stale: &Arc<MuxConn>) {
        let mut current = self.conn.write().await;
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, stale)) {
            *current = None;
        }
    }

    /// Writes one frame, replacing broken connections along the way.
    async fn write_frame(
        &self,
        wire: &[u8],
        deadline: &CallDeadline,
    ) -> Result<Arc<MuxConn>, RpcError> {
        let mut last_err = RpcError::ConnectionClosed;
        for attempt in 1..=WRITE_ATTEMPTS {
            let conn = self.get_conn(deadline).await?;
            match conn.write(wire, deadline.at).await {
                Ok(()) => return Ok(conn),
                Err(RpcError::Timeout) => return Err(RpcError::Timeout),
                Err(e) => {
                    tracing::warn!(conn = conn.id, attempt, error = %e, "write failed");
                    conn.close(CloseReason::Broken);
                    // closed connections already count as absent, so giving up here is harmless
                    let _ = tokio::time::timeout_at(deadline.at, self.destroy_conn(&conn)).await;
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Sends `req` over its own TCP connection to `target`.
    async fn call_direct(&self, req: RpcRequest, target: String) -> Result<RpcResponse, RpcError> {
        let deadline = CallDeadline::for_request(&req);
        let mut frame = self.protocol.to_frame(&req);
        frame.request_id = self.next_request_id();
        let wire = self.protocol.encode(&frame)?;

        let response = deadline
            .run(async {
                let mut stream = TcpStream::connect(&target)
                    .await
                    .map_err(|e| RpcError::ConnectionFailed(format!("{target}: {e}")))?;
                stream
                    .write_all(&wire)
                    .await
                    .map_err(|e| RpcError::Unavailable(format!("write failed: {e}")))?;

                let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
                loop {
                    let read = stream
                        .read_buf(&mut buf)
                        .await
                        .map_err(|e| RpcError::Unavailable(format!("read failed: {e}")))?;
                    if read == 0 {
                        return Err(RpcError::ConnectionClosed);
                    }
                    while let Some(frame) = self.protocol.decode(&mut buf)? {
                        if frame.is_response() {
                            return Ok(frame);
                        }
                    }
                }
            })
            .await?;

        tracing::debug!(address = %target, request_id = frame.request_id, "direct call completed");
        Ok(self.protocol.from_frame(response)?)
    }
}

#[async_trait]
impl Channel for MultiplexedChannel {
    async fn call(&self, req: RpcRequest) -> Result<RpcResponse, RpcError> {
        let target = req.header.get(TARGET_ADDRESS);
        if !target.is_empty() {
            return self.call_direct(req, target).await;
        }

        let deadline = CallDeadline::for_request(&req);
        let mut frame = self.protocol.to_frame(&req);
        frame.request_id = self.next_request_id();
        let wire = self.protocol.encode(&frame)?;

        let (_guard, response) = self.pending.register(frame.request_id);
        let conn = self.write_frame(&wire, &deadline).await?;

        let frame = tokio::select! {
            biased;
            frame = response => frame.map_err(|_| conn.failure())?,
            () = tokio::time::sleep_until(deadline.at) => return Err(RpcError::Timeout),
            () = deadline.cancel.cancelled() => return Err(RpcError::Timeout),
            () = conn.closed.cancelled() => return Err(conn.failure()),
        };
        Ok(self.protocol.from_frame(frame)?)
    }
}

impl fmt::Debug for MultiplexedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedChannel")
            .field("listener", &self.listener)
            .field("protocol", &self.protocol.name())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxConnection>,
    conn: Arc<MuxConn>,
    protocol: Arc<dyn TransportProtocol>,
    pending: Arc<PendingTable>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let reason = loop {
        let read = tokio::select! {
            read = reader.read_buf(&mut buf) => read,
            () = conn.closed.cancelled() => return,
        };
        match read {
            Ok(0) => {
                tracing::debug!(conn = conn.id, "multiplexed connection reached eof");
                break CloseReason::Remote;
            }
            Ok(_) => {
                if let Err(e) = dispatch(&*protocol, &mut buf, &pending) {
                    tracing::error!(conn = conn.id, error = %e, "undecodable frame");
                    break CloseReason::Malformed;
                }
            }
            Err(e) => {
                tracing::error!(conn = conn.id, error = %e, "multiplexed read failed");
                break CloseReason::Remote;
            }
        }
    };
    conn.close(reason);
}

/// Delivers every complete frame in `buf` to its waiter.
fn dispatch(
    protocol: &dyn TransportProtocol,
    buf: &mut BytesMut,
    pending: &PendingTable,
) -> Result<(), tether_proto::ProtocolError> {
    while let Some(frame) = protocol.decode(buf)? {
        if !frame.is_response() {
            tracing::debug!(kind = ?frame.kind, "ignoring inbound non-response frame");
            continue;
        }
        match pending.take(frame.request_id) {
            Some(waiter) => {
                let _ = waiter.send(frame);
            }
            None => {
                tracing::debug!(request_id = frame.request_id, "dropping response with no waiter");
            }
        }
    }
    Ok(())
}
