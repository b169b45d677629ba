//! Two-party session over TCP.
//!
//! A session is created either by the host accepting a connection on its
//! [`SessionListener`] or by a joiner calling [`SessionChannel::connect`].
//! From then on both sides are symmetric: each can [`send`] a record and
//! [`receive`] the most recent record from the peer.
//!
//! # Latest-record slot
//!
//! The session is meant for periodic state snapshots.  A background task
//! reads the socket, decodes frames and *overwrites* a single slot with each
//! decoded record.  [`receive`] takes whatever is in the slot.  If the peer
//! sends faster than the application reads, intermediate records are
//! skipped: the reader always sees the newest state, never a backlog.
//!
//! ```text
//!  socket ─▶ receive task ─▶ FrameBuffer ─▶ [ slot ] ─▶ receive()
//!                                         (overwrite)   (take)
//! ```
//!
//! # Sending without blocking
//!
//! [`send`] performs one non-blocking write.  If the kernel send buffer is
//! full the frame is dropped and `false` is returned; nothing is queued.
//! A write that only got part of a frame out leaves a torn frame on the
//! wire; the next send starts with [`FRAME_ABORT`], a NUL byte and a
//! delimiter.  NUL cannot appear in JSON, so the peer always discards the
//! fragment as one malformed segment and resynchronises, even when the cut
//! falls inside a bare number or string record.
//!
//! # Termination
//!
//! EOF, a read error, or a fatal write error clears the connectivity flag.
//! A session never reconnects.
//!
//! [`send`]: SessionChannel::send
//! [`receive`]: SessionChannel::receive

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream as StdTcpStream};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::Duration;

use lobby_core::protocol::codec::FRAME_ABORT;
use lobby_core::{encode, FrameBuffer, SessionRole};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;

/// Errors that can occur while setting up a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The listening socket could not be bound.
    #[error("failed to bind session listener on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The peer refused or was unreachable.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The peer did not answer within the connect timeout.
    #[error("connection to {addr} timed out after {timeout:?}")]
    ConnectTimedOut { addr: SocketAddr, timeout: Duration },
    /// Socket configuration or accept failed.
    #[error("session I/O error: {0}")]
    Io(#[from] io::Error),
    /// Sessions spawn a Tokio task and must be created inside a runtime.
    #[error("sessions must be created from within a Tokio runtime")]
    NoRuntime,
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// Host-side passive socket.  Polled with [`try_accept`](Self::try_accept).
pub struct SessionListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl SessionListener {
    /// Binds a non-blocking listener.  Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// [`SessionError::BindFailed`] if the address is unavailable.
    pub fn bind(addr: SocketAddr) -> Result<Self, SessionError> {
        let listener = TcpListener::bind(addr).map_err(|source| SessionError::BindFailed { addr, source })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("session listener bound on TCP {local_addr}");
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns immediately: `Ok(None)` if nobody is waiting, otherwise a new
    /// host-side session with its receive task running.
    ///
    /// # Errors
    ///
    /// [`SessionError::Io`] if `accept` fails for a reason other than "no
    /// pending connection", or the accepted socket cannot be configured.
    pub fn try_accept(&self) -> Result<Option<SessionChannel>, SessionError> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                info!("accepted session connection from {peer}");
                SessionChannel::from_std(stream, SessionRole::Host).map(Some)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(SessionError::Io(e)),
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// State touched by both the receive task and the caller.
#[derive(Debug)]
struct SessionShared {
    latest: Mutex<Option<Value>>,
    connected: AtomicBool,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            latest: Mutex::new(None),
            connected: AtomicBool::new(true),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Value>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, record: Value) {
        *self.slot() = Some(record);
    }

    fn take(&self) -> Option<Value> {
        self.slot().take()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Clears the flag; returns `true` if this call did the transition.
    fn disconnect(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }
}

/// Write side of the socket.
#[derive(Debug)]
struct Writer {
    stream: StdTcpStream,
    /// The last write left part of a frame on the wire.
    torn: bool,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A live point-to-point session.
pub struct SessionChannel {
    role: SessionRole,
    peer_addr: SocketAddr,
    writer: Mutex<Writer>,
    shared: Arc<SessionShared>,
    reader: JoinHandle<()>,
}

impl SessionChannel {
    /// Connects to a host, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`SessionError::ConnectFailed`] or [`SessionError::ConnectTimedOut`];
    /// in either case no session exists afterwards.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, SessionError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(SessionError::ConnectFailed { addr, source }),
            Err(_) => return Err(SessionError::ConnectTimedOut { addr, timeout }),
        };
        info!("connected to session host at {addr}");
        Self::from_std(stream.into_std()?, SessionRole::Client)
    }

    /// Wraps an already connected stream and starts the receive task.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoRuntime`] outside Tokio, [`SessionError::Io`] if the
    /// socket cannot be configured or duplicated.
    pub fn from_std(stream: StdTcpStream, role: SessionRole) -> Result<Self, SessionError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;

        let read_half = {
            let _guard = handle.enter();
            TcpStream::from_std(stream.try_clone()?)?
        };

        let shared = Arc::new(SessionShared::new());
        let reader = handle.spawn(receive_loop(read_half, Arc::clone(&shared), peer_addr));

        info!("session established with {peer_addr} as {role}");

        Ok(Self {
            role,
            peer_addr,
            writer: Mutex::new(Writer { stream, torn: false }),
            shared,
            reader,
        })
    }

    /// Encodes `record` and writes it without blocking.
    ///
    /// Returns `false` (never an error) when the session is down, the send
    /// buffer is full, or the transport fails.  Transport failures also end
    /// the session.
    pub fn send<T: Serialize + ?Sized>(&self, record: &T) -> bool {
        if !self.shared.is_connected() {
            return false;
        }

        let frame = match encode(record) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("not sending record to {}: {e}", self.peer_addr);
                return false;
            }
        };

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = if writer.torn {
            let mut prefixed = Vec::with_capacity(FRAME_ABORT.len() + frame.len());
            prefixed.extend_from_slice(FRAME_ABORT);
            prefixed.extend_from_slice(&frame);
            prefixed
        } else {
            frame
        };

        match writer.stream.write(&bytes) {
            Ok(n) if n == bytes.len() => {
                writer.torn = false;
                true
            }
            Ok(0) => {
                drop(writer);
                self.mark_disconnected("peer stopped accepting data");
                false
            }
            Ok(n) => {
                debug!("partial write to {} ({n}/{} bytes); frame dropped", self.peer_addr, bytes.len());
                writer.torn = true;
                false
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                debug!("send buffer to {} full; frame dropped", self.peer_addr);
                false
            }
            Err(e) => {
                drop(writer);
                self.mark_disconnected(&format!("write failed: {e}"));
                false
            }
        }
    }

    /// Takes the most recent record received since the last call.
    pub fn receive(&self) -> Option<Value> {
        self.shared.take()
    }

    /// Like [`receive`](Self::receive) but deserializes into `T`.
    ///
    /// A record of the wrong shape is logged and discarded.
    pub fn receive_as<T: DeserializeOwned>(&self) -> Option<T> {
        let value = self.shared.take()?;
        match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("protocol violation from {}: {e}", self.peer_addr);
                None
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role.is_host()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Ends the session.  Idempotent.
    pub fn close(&self) {
        if self.shared.disconnect() {
            info!("closing session with {}", self.peer_addr);
        }
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        // Also wakes the receive task with EOF.
        let _ = writer.stream.shutdown(Shutdown::Both);
        drop(writer);
        self.reader.abort();
    }

    fn mark_disconnected(&self, reason: &str) {
        if self.shared.disconnect() {
            warn!("session with {} lost: {reason}", self.peer_addr);
        }
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Body of the receive task.  Runs until EOF or a read error.
async fn receive_loop(mut stream: TcpStream, shared: Arc<SessionShared>, peer: SocketAddr) {
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => {
                info!("peer {peer} closed the session");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("read from {peer} failed: {e}");
                break;
            }
        };

        // Only the newest record of this batch matters.
        if let Some(latest) = frames.push::<Value>(&chunk[..n]).pop() {
            shared.publish(latest);
        }
    }

    shared.disconnect();
}

// ── Tests ─────────────────────────────────────────────────────────────────────
