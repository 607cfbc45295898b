//! TCP front end: accepts connections, reads class tags, stamps acceptance,
//! and routes jobs to the scheduler inlets.
//!
//! Each connection gets its own handler thread and may carry any number of
//! sequential requests. Reads are armed with a short timeout so blocked
//! handlers notice cancellation within one poll interval instead of holding
//! the process open.

use crate::buffer_pool::BufferPool;
use crate::request::{Job, RequestClass, TAG_LEN};
use crate::shutdown::ShutdownToken;
use crossbeam_channel::{SendError, Sender};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often blocked reads re-check the shutdown token.
const READ_POLL: Duration = Duration::from_millis(100);
/// Accept-loop pause while no connection is pending.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Where inbound jobs go relative to the scheduler inlets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Everything to the high inlet (FCFS: one global queue).
    AllHigh,
    /// Fast to the high inlet, slow to the low inlet (DRR).
    ByClass,
}

pub struct Server {
    high: Sender<Job>,
    low: Sender<Job>,
    routing: Routing,
    buffers: BufferPool,
    in_flight: Arc<AtomicI64>,
}

enum TagRead {
    Tag,
    Eof,
    Cancelled,
}

impl Server {
    pub fn new(
        high: Sender<Job>,
        low: Sender<Job>,
        routing: Routing,
        in_flight: Arc<AtomicI64>,
    ) -> Server {
        Server {
            high,
            low,
            routing,
            buffers: BufferPool::new(),
            in_flight,
        }
    }

    /// Bind the listener. Kept separate from [`BoundServer::serve`] so
    /// callers can learn the ephemeral port before serving.
    pub fn bind(self, addr: &str) -> io::Result<BoundServer> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(BoundServer {
            listener,
            server: Arc::new(self),
        })
    }

    fn handle_connection(&self, stream: TcpStream, token: &ShutdownToken) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if stream.set_nonblocking(false).is_err()
            || stream.set_read_timeout(Some(READ_POLL)).is_err()
        {
            tracing::warn!(%peer, "cannot configure connection, dropping it");
            return;
        }
        let client = Arc::new(stream);

        loop {
            let mut lease = self.buffers.lease(TAG_LEN);
            let tag = &mut lease.as_mut_slice()[..TAG_LEN];
            match read_tag(&client, tag, token) {
                Ok(TagRead::Tag) => {}
                Ok(TagRead::Eof) | Ok(TagRead::Cancelled) => return,
                Err(err) => {
                    tracing::warn!(%peer, error = %err, "connection error");
                    return;
                }
            }

            let Some(class) = RequestClass::decode(tag) else {
                tracing::warn!(%peer, "unknown request tag, skipping");
                continue;
            };

            self.in_flight.fetch_add(1, Ordering::Relaxed);
            if self.route(Job::accepted(class, client.clone())).is_err() {
                // Scheduler is gone; nothing left to serve here.
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        }
    }

    fn route(&self, job: Job) -> Result<(), SendError<Job>> {
        match (self.routing, job.class) {
            (Routing::ByClass, RequestClass::Slow) => self.low.send(job),
            _ => self.high.send(job),
        }
    }
}

/// A server with its listener bound, ready to accept.
pub struct BoundServer {
    listener: TcpListener,
    server: Arc<Server>,
}

impl BoundServer {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until the token fires. Listener errors other than an empty
    /// backlog are logged and accepting resumes.
    pub fn serve(&self, token: &ShutdownToken) -> io::Result<()> {
        loop {
            if token.is_triggered() {
                return Ok(());
            }
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let server = self.server.clone();
                    let token = token.clone();
                    thread::spawn(move || server.handle_connection(stream, &token));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
    }
}

/// Read exactly one 4-byte tag, tolerating timeout polls and partial reads.
fn read_tag(stream: &TcpStream, buf: &mut [u8], token: &ShutdownToken) -> io::Result<TagRead> {
    let mut reader = stream;
    let mut filled = 0;
    while filled < buf.len() {
        if token.is_triggered() {
            return Ok(TagRead::Cancelled);
        }
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(TagRead::Eof),
            Ok(n) => filled += n,
            Err(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                continue
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(TagRead::Tag)
}
