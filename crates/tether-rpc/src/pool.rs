//! Bounded pool of reusable connections.
//!
//! Capacity is a semaphore sized to `max_active`: every successful
//! [`ConnPool::get`] holds one permit until the matching [`ConnPool::put`]
//! (or until the [`Checkout`] is dropped). Idle connections sit on a free
//! list and are handed out most-recently-returned first.
//!
//! A dialer may hand back the read half of its connection. When the pool
//! has a [`DataHandler`], a background task reads that half and pushes the
//! accumulated bytes to the handler; any read or handler error closes the
//! connection.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;

/// Initial capacity of a read loop's buffer.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Read half driven by the pool's read loop.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Result of dialing.
pub struct Dialed<C> {
    pub conn: C,
    /// Read half for the read loop, if the connection is push-based.
    pub reader: Option<BoxReader>,
}

impl<C> Dialed<C> {
    pub const fn new(conn: C) -> Self {
        Self { conn, reader: None }
    }

    pub fn with_reader(conn: C, reader: BoxReader) -> Self {
        Self {
            conn,
            reader: Some(reader),
        }
    }
}

/// Creates new connections for a pool.
#[async_trait]
pub trait Dialer<C>: Send + Sync {
    async fn dial(&self) -> Result<Dialed<C>, RpcError>;
}

/// Consumes bytes pushed by a connection's read loop.
pub trait DataHandler<S>: Send + Sync {
    /// Consumes every complete message in `buf`, leaving partial data behind.
    fn on_data(&self, buf: &mut BytesMut, state: &S) -> Result<(), RpcError>;

    /// Runs once after the read loop stops, with the error that stopped it.
    fn on_close(&self, _state: &S, _err: &RpcError) {}
}

/// A connection owned by the pool, with its per-connection state.
pub struct PooledConn<C, S> {
    conn: C,
    state: Arc<S>,
    closed: CancellationToken,
}

impl<C, S> PooledConn<C, S> {
    fn new(conn: C, state: S) -> Self {
        Self {
            conn,
            state: Arc::new(state),
            closed: CancellationToken::new(),
        }
    }

    pub const fn conn(&self) -> &C {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Fires once the connection is closed by either side.
    pub fn close_notifier(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Marks the connection closed. Safe to call any number of times.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl<C, S> Drop for PooledConn<C, S> {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// A connection checked out of the pool. Holds one unit of capacity.
pub struct Checkout<C, S> {
    pooled: PooledConn<C, S>,
    _permit: OwnedSemaphorePermit,
}

impl<C, S> Deref for Checkout<C, S> {
    type Target = PooledConn<C, S>;

    fn deref(&self) -> &Self::Target {
        &self.pooled
    }
}

impl<C, S> DerefMut for Checkout<C, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.pooled
    }
}

/// Generic connection pool.
pub struct ConnPool<C, S = ()> {
    max_active: usize,
    dialer: Box<dyn Dialer<C>>,
    handler: Option<Arc<dyn DataHandler<S>>>,
    sema: Arc<Semaphore>,
    free: Mutex<VecDeque<PooledConn<C, S>>>,
}

impl<C, S> ConnPool<C, S>
where
    C: Send + 'static,
    S: Default + Send + Sync + 'static,
{
    /// Creates a pool of at most `max_active` connections (at least one).
    pub fn new(max_active: usize, dialer: impl Dialer<C> + 'static) -> Self {
        let max_active = max_active.max(1);
        Self {
            max_active,
            dialer: Box::new(dialer),
            handler: None,
            sema: Arc::new(Semaphore::new(max_active)),
            free: Mutex::new(VecDeque::with_capacity(max_active)),
        }
    }

    /// Drives the read half of every dialed connection through `handler`.
    #[must_use]
    pub fn with_data_handler(mut self, handler: impl DataHandler<S> + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub const fn max_active(&self) -> usize {
        self.max_active
    }

    /// Number of connections currently checked out.
    pub fn active(&self) -> usize {
        self.max_active - self.sema.available_permits()
    }

    /// Number of connections on the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Checks out a connection, waiting for capacity until `deadline` or
    /// until `cancel` fires.
    pub async fn get(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Checkout<C, S>, RpcError> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.sema).acquire_owned() => permit
                .map_err(|_| RpcError::Unavailable("connection pool closed".into()))?,
            () = tokio::time::sleep_until(deadline) => return Err(RpcError::PoolTimeout),
            () = cancel.cancelled() => return Err(RpcError::PoolTimeout),
        };

        loop {
            let idle = self.free.lock().pop_back();
            match idle {
                Some(pooled) if !pooled.is_closed() => {
                    return Ok(Checkout {
                        pooled,
                        _permit: permit,
                    })
                }
                Some(_) => continue,
                None => break,
            }
        }

        // the permit is released if dialing fails
        let dialed = tokio::time::timeout_at(deadline, self.dialer.dial())
            .await
            .map_err(|_| RpcError::PoolTimeout)??;

        let pooled = PooledConn::new(dialed.conn, S::default());
        if let (Some(handler), Some(reader)) = (&self.handler, dialed.reader) {
            tokio::spawn(read_loop(
                reader,
                Arc::clone(handler),
                Arc::clone(&pooled.state),
                pooled.closed.clone(),
            ));
        }

        Ok(Checkout {
            pooled,
            _permit: permit,
        })
    }

    /// Returns a connection, closing it instead when `force_close` is set,
    /// when it is already closed, or when the free list is full.
    pub fn put(&self, checkout: Checkout<C, S>, force_close: bool) {
        let Checkout { pooled, _permit } = checkout;
        if force_close || pooled.is_closed() {
            pooled.close();
            return;
        }

        let mut free = self.free.lock();
        if free.len() < self.max_active {
            free.push_back(pooled);
        } else {
            drop(free);
            pooled.close();
        }
    }
}

impl<C, S> fmt::Debug for ConnPool<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnPool")
            .field("max_active", &self.max_active)
            .field("available", &self.sema.available_permits())
            .field("idle", &self.free.lock().len())
            .finish_non_exhaustive()
    }
}

async fn read_loop<S>(
    mut reader: BoxReader,
    handler: Arc<dyn DataHandler<S>>,
    state: Arc<S>,
    closed: CancellationToken,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let err = loop {
        let read = tokio::select! {
            read = reader.read_buf(&mut buf) => read,
            () = closed.cancelled() => break RpcError::ConnectionClosed,
        };
        match read {
            Ok(0) => {
                tracing::debug!("connection pool read loop reached eof");
                break RpcError::ConnectionClosed;
            }
            Ok(_) => {
                if let Err(e) = handler.on_data(&mut buf, &state) {
                    tracing::error!(error = %e, "connection pool data handler failed");
                    break e;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "connection pool read loop failed");
                break RpcError::Io(e);
            }
        }
    };
    handler.on_close(&state, &err);
    closed.cancel();
}
