//! Connection-tracking listener and listener inheritance.
//!
//! [`TrackingListener`] wraps one listening socket and counts accepted
//! connections that have not been closed yet. Stopping it halts the accept
//! loop but keeps the socket open, so the descriptor can still be exported
//! to a successor process after the old generation has drained.
//!
//! [`InheritedListeners`] adopts descriptors passed down by a parent via
//! `LISTEN_FDS` and `LISTEN_FD_NAMES` (compatible with systemd socket
//! activation). Descriptors start at [`INHERITED_FD_START`].

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::tracker::{DrainGuard, DrainTracker};

/// First descriptor slot used for inherited listeners.
pub const INHERITED_FD_START: RawFd = 3;

/// Number of inherited descriptors.
pub const LISTEN_FDS: &str = "LISTEN_FDS";

/// Colon-separated names, one per inherited descriptor.
pub const LISTEN_FD_NAMES: &str = "LISTEN_FD_NAMES";

/// Errors raised while exporting a listener descriptor.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener descriptor {fd} is no longer a valid socket")]
    DescriptorExtraction { fd: RawFd },
}

/// Errors raised while adopting inherited descriptors.
///
/// A half-inherited state is a bug in the parent process, so every variant
/// is fatal at startup.
#[derive(Debug, Error)]
pub enum InheritError {
    #[error("LISTEN_FDS is not a valid descriptor count: {0:?}")]
    InvalidCount(String),

    #[error("LISTEN_FDS is set but LISTEN_FD_NAMES is missing")]
    MissingNames,

    #[error("LISTEN_FD_NAMES has {names} entries but LISTEN_FDS says {fds}")]
    CountMismatch { names: usize, fds: usize },

    #[error("inherited fd {fd} (name: {name}) is not a valid socket")]
    NotASocket { fd: RawFd, name: String },

    #[error("failed to adopt inherited fd {fd} (name: {name}): {source}")]
    Adopt {
        fd: RawFd,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("asked to inherit a listener but the parent passed no descriptors")]
    NothingInherited,

    #[error("expected inherited listener '{name}' but only have {available:?}")]
    Missing { name: String, available: Vec<String> },

    #[error("unconsumed inherited listeners: {0:?}")]
    Unconsumed(Vec<String>),
}

/// A set of named listeners inherited from the parent process.
#[derive(Debug)]
pub struct InheritedListeners {
    listeners: Vec<(String, TcpListener)>,
}

impl InheritedListeners {
    /// Adopt inherited descriptors described by the environment.
    ///
    /// Returns `Ok(None)` if `LISTEN_FDS` is absent or "0" (cold start).
    /// The variables are cleared afterwards so our own children never
    /// re-inherit stale values.
    pub fn from_env() -> Result<Option<Self>, InheritError> {
        let fds = std::env::var(LISTEN_FDS).ok();
        let names = std::env::var(LISTEN_FD_NAMES).ok();

        let Some(slots) = parse_slots(fds.as_deref(), names.as_deref())? else {
            return Ok(None);
        };

        let mut listeners = Vec::with_capacity(slots.len());
        for (name, fd) in slots {
            if !validate_fd(fd) {
                return Err(InheritError::NotASocket { fd, name });
            }

            // SAFETY: fstat confirmed the descriptor is an open socket, and
            // the parent handed ownership of it to this process.
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
            let listener = std_listener
                .set_nonblocking(true)
                .and_then(|()| TcpListener::from_std(std_listener))
                .map_err(|source| InheritError::Adopt {
                    fd,
                    name: name.clone(),
                    source,
                })?;

            let addr = listener.local_addr().ok();
            info!(fd, name = %name, addr = ?addr, "Inherited listener from parent process");
            listeners.push((name, listener));
        }

        std::env::remove_var(LISTEN_FDS);
        std::env::remove_var(LISTEN_FD_NAMES);

        Ok(Some(Self { listeners }))
    }

    /// Take a listener by name, removing it from the set.
    pub fn take(&mut self, name: &str) -> Result<TcpListener, InheritError> {
        let pos = self
            .listeners
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| InheritError::Missing {
                name: name.to_string(),
                available: self.names(),
            })?;
        Ok(self.listeners.remove(pos).1)
    }

    /// Check that every inherited listener has been consumed.
    pub fn finish(self) -> Result<(), InheritError> {
        if self.listeners.is_empty() {
            Ok(())
        } else {
            Err(InheritError::Unconsumed(self.names()))
        }
    }

    fn names(&self) -> Vec<String> {
        self.listeners.iter().map(|(n, _)| n.clone()).collect()
    }
}

/// Map `LISTEN_FDS` / `LISTEN_FD_NAMES` values to `(name, fd)` slots.
fn parse_slots(
    listen_fds: Option<&str>,
    names: Option<&str>,
) -> Result<Option<Vec<(String, RawFd)>>, InheritError> {
    let count: usize = match listen_fds {
        None => 0,
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| InheritError::InvalidCount(raw.to_string()))?,
    };

    if count == 0 {
        return Ok(None);
    }

    let names: Vec<&str> = names.ok_or(InheritError::MissingNames)?.split(':').collect();
    if names.len() != count {
        return Err(InheritError::CountMismatch {
            names: names.len(),
            fds: count,
        });
    }

    Ok(Some(
        names
            .into_iter()
            .zip(INHERITED_FD_START..)
            .map(|(name, fd)| (name.to_string(), fd))
            .collect(),
    ))
}

/// Validate that a file descriptor is an open socket using fstat.
pub(crate) fn validate_fd(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    // SAFETY: fstat only writes into the zeroed stat buffer we own.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// One listening socket plus a live-connection count.
///
/// The socket stays open for as long as the `TrackingListener` (or any
/// [`Acceptor`] created from it) is alive. Stopping the accept loop never
/// touches live connections.
pub struct TrackingListener {
    socket: Arc<TcpListener>,
    connections: DrainTracker,
    accepting: Mutex<CancellationToken>,
}

impl TrackingListener {
    /// Wrap an already-bound tokio listener.
    pub fn new(socket: TcpListener, connections: DrainTracker) -> Self {
        Self {
            socket: Arc::new(socket),
            connections,
            accepting: Mutex::new(CancellationToken::new()),
        }
    }

    /// Bind a fresh socket.
    pub async fn bind(addr: SocketAddr, connections: DrainTracker) -> io::Result<Self> {
        let socket = TcpListener::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "Bound listener");
        Ok(Self::new(socket, connections))
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Create an accept handle bound to the current accepting generation.
    ///
    /// Once [`stop_accepting`](Self::stop_accepting) is called, every
    /// acceptor created before that point stops for good.
    pub fn acceptor(&self) -> Acceptor {
        Acceptor {
            socket: Arc::clone(&self.socket),
            connections: self.connections.clone(),
            stop: self.current_token(),
        }
    }

    /// Stop every accept loop. The socket itself stays open.
    pub fn stop_accepting(&self) {
        debug!("Stopping accept loops");
        self.current_token().cancel();
    }

    /// Allow new acceptors after a previous stop.
    pub fn resume_accepting(&self) {
        let mut token = self.accepting.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
            debug!("Accepting resumed");
        }
    }

    /// Whether acceptors created now would accept connections.
    pub fn is_accepting(&self) -> bool {
        !self.current_token().is_cancelled()
    }

    /// Number of accepted connections not yet closed.
    pub fn active_connections(&self) -> usize {
        self.connections.outstanding()
    }

    /// Stop accepting, then wait for live connections to reach zero.
    ///
    /// Returns `true` if all connections drained, `false` on timeout. The
    /// socket remains open so its descriptor can still be exported.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop_accepting();
        let drained = self.connections.drain(timeout).await;
        if drained {
            info!("All connections drained");
        }
        drained
    }

    /// Shut down and release this generation's handle to the socket.
    pub async fn close(self, timeout: Duration) -> bool {
        self.shutdown(timeout).await
    }

    /// Borrow the socket descriptor for inheritance by a child process.
    ///
    /// Ownership stays with this listener; the caller must make its own copy
    /// (e.g. `dup2` in the child) before the listener is released.
    pub fn export_handle(&self) -> Result<BorrowedFd<'_>, ListenerError> {
        let fd = self.socket.as_raw_fd();
        if !validate_fd(fd) {
            return Err(ListenerError::DescriptorExtraction { fd });
        }
        Ok(self.socket.as_fd())
    }

    fn current_token(&self) -> CancellationToken {
        self.accepting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Accept half of a [`TrackingListener`] generation.
pub struct Acceptor {
    socket: Arc<TcpListener>,
    connections: DrainTracker,
    stop: CancellationToken,
}

impl Acceptor {
    /// Wait for the next connection.
    ///
    /// Returns `Ok(None)` once the listener has stopped accepting.
    pub async fn accept(&mut self) -> io::Result<Option<(TrackedStream, SocketAddr)>> {
        if self.stop.is_cancelled() {
            return Ok(None);
        }

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Ok(None),
            res = self.socket.accept() => {
                let (stream, addr) = res?;
                let guard = self.connections.enter();
                debug!(peer = %addr, active = self.connections.outstanding(), "Accepted connection");
                Ok(Some((TrackedStream::new(stream, guard), addr)))
            }
        }
    }

    /// Whether this acceptor has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// An accepted connection counted by its listener until closed or dropped.
///
/// After [`close`](Self::close) reads report end of stream and writes fail
/// with `NotConnected`.
#[derive(Debug)]
pub struct TrackedStream {
    stream: TcpStream,
    guard: Option<DrainGuard>,
}

impl TrackedStream {
    fn new(stream: TcpStream, guard: DrainGuard) -> Self {
        Self {
            stream,
            guard: Some(guard),
        }
    }

    /// Shut the connection down and release its count.
    ///
    /// Only the first call does either; returns whether this call did. The
    /// count is released even when the shutdown itself fails.
    pub async fn close(&mut self) -> io::Result<bool> {
        let Some(guard) = self.guard.take() else {
            return Ok(false);
        };
        let result = self.stream.shutdown().await;
        drop(guard);
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_none()
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.is_closed() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.is_closed() {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        if self.is_closed() {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
