//! Bounded pool of outbound TCP connections to a single address.
//!
//! `get` serves idle connections first, dials while capacity remains, and
//! otherwise queues the request for a background worker that has a hard
//! three-second deadline to produce a connection. Queued requests are served
//! in FIFO order. `open` always equals checked-out plus idle handles.

use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Hard deadline for a queued connection request.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_QUEUE_CAP: usize = 10_000;
const RETRY_PAUSE: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection request timed out")]
    AcquireTimeout,
    #[error("connection pool is closed")]
    Closed,
    #[error("dial {address}: {source}")]
    Dial { address: String, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub address: String,
    pub max_open: usize,
    pub max_idle: usize,
}

/// One pooled connection. Carries a numeric id rather than a handle back
/// into the pool; callers return it with [`TcpConnPool::put`] or drop it via
/// [`TcpConnPool::discard`].
pub struct PooledConn {
    pub id: u64,
    pub stream: TcpStream,
}

struct PoolState {
    idle: VecDeque<PooledConn>,
    open: usize,
    closed: bool,
}

struct PoolInner {
    address: String,
    max_open: usize,
    max_idle: usize,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn dial(&self) -> Result<PooledConn, PoolError> {
        let stream = TcpStream::connect(&self.address).map_err(|source| PoolError::Dial {
            address: self.address.clone(),
            source,
        })?;
        Ok(PooledConn {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            stream,
        })
    }

    fn abandon_slot(&self) {
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);
    }

    /// Non-blocking acquisition attempt: idle first, then fresh capacity.
    /// `None` means the pool is at capacity with nothing idle.
    fn try_acquire(&self) -> Option<Result<PooledConn, PoolError>> {
        let mut state = self.state.lock();
        if state.closed {
            return Some(Err(PoolError::Closed));
        }
        if let Some(conn) = state.idle.pop_front() {
            return Some(Ok(conn));
        }
        if state.open < self.max_open {
            state.open += 1;
            drop(state);
            return Some(self.dial().map_err(|err| {
                self.abandon_slot();
                err
            }));
        }
        None
    }

    fn release(&self, conn: PooledConn) {
        let mut state = self.state.lock();
        if !state.closed && state.idle.len() < self.max_idle {
            state.idle.push_back(conn);
        } else {
            state.open = state.open.saturating_sub(1);
            // Dropping the connection closes the socket.
        }
    }
}

struct ConnRequest {
    reply: Sender<Result<PooledConn, PoolError>>,
}

pub struct TcpConnPool {
    inner: Arc<PoolInner>,
    requests: Sender<ConnRequest>,
}

impl TcpConnPool {
    /// Create the pool and start the worker serving queued requests.
    pub fn new(config: PoolConfig) -> TcpConnPool {
        let (requests, queue) = bounded(REQUEST_QUEUE_CAP);
        let inner = Arc::new(PoolInner {
            address: config.address,
            max_open: config.max_open.max(1),
            max_idle: config.max_idle,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                open: 0,
                closed: false,
            }),
            next_id: AtomicU64::new(0),
        });
        let worker_inner = inner.clone();
        thread::spawn(move || serve_requests(worker_inner, queue));
        TcpConnPool { inner, requests }
    }

    /// Acquire a connection: idle, fresh dial, or queued wait with the hard
    /// [`ACQUIRE_TIMEOUT`] deadline.
    pub fn get(&self) -> Result<PooledConn, PoolError> {
        match self.inner.try_acquire() {
            Some(result) => result,
            None => {
                let (reply, response) = bounded(1);
                self.requests
                    .send(ConnRequest { reply })
                    .map_err(|_| PoolError::Closed)?;
                response.recv().unwrap_or(Err(PoolError::Closed))
            }
        }
    }

    /// Return a connection. Idles it while room remains, closes it otherwise.
    pub fn put(&self, conn: PooledConn) {
        self.inner.release(conn);
    }

    /// Drop a connection that must not be reused (broken peer, mid-request
    /// cancellation). Frees its capacity slot.
    pub fn discard(&self, conn: PooledConn) {
        let mut state = self.inner.state.lock();
        state.open = state.open.saturating_sub(1);
        drop(conn);
    }

    /// Close the pool: queued waiters fail with [`PoolError::Closed`] and
    /// the idle set is drained and closed.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.open = state.open.saturating_sub(state.idle.len());
        state.idle.clear();
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize) {
        let state = self.inner.state.lock();
        (state.open, state.idle.len())
    }
}

impl Drop for TcpConnPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pool worker: serves queued requests in FIFO order, each under its own
/// three-second deadline. Retries acquisition until a connection frees up,
/// a dial slot opens, or the deadline fires.
fn serve_requests(inner: Arc<PoolInner>, queue: Receiver<ConnRequest>) {
    for request in queue.iter() {
        let deadline = after(ACQUIRE_TIMEOUT);
        loop {
            select! {
                recv(deadline) -> _ => {
                    let _ = request.reply.send(Err(PoolError::AcquireTimeout));
                    break;
                }
                default => match inner.try_acquire() {
                    Some(Ok(conn)) => {
                        if let Err(unclaimed) = request.reply.send(Ok(conn)) {
                            // Waiter vanished; keep the connection usable.
                            if let Ok(conn) = unclaimed.into_inner() {
                                inner.release(conn);
                            }
                        }
                        break;
                    }
                    Some(Err(PoolError::Closed)) => {
                        let _ = request.reply.send(Err(PoolError::Closed));
                        break;
                    }
                    // Dial failed or capacity exhausted: retry until deadline.
                    Some(Err(_)) | None => thread::sleep(RETRY_PAUSE),
                },
            }
        }
    }
}
