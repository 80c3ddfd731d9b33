//! Adapter serving axum from a tracking listener.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use moult_handoff::{Acceptor, TrackedStream};
use tracing::{error, warn};

/// Feeds connections from one [`Acceptor`] generation into `axum::serve`.
///
/// Every connection keeps its drain guard until hyper drops the stream.
/// Once the generation is stopped the acceptor parks forever and the
/// server's graceful shutdown takes over.
pub struct HandoffAcceptor {
    inner: Acceptor,
}

impl HandoffAcceptor {
    pub fn new(inner: Acceptor) -> Self {
        Self { inner }
    }
}

impl axum::serve::Listener for HandoffAcceptor {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok(Some(conn)) => return conn,
                Ok(None) => std::future::pending::<()>().await,
                Err(e) if is_connection_error(&e) => {
                    warn!(error = %e, "Connection dropped before accept completed");
                }
                Err(e) => {
                    // Usually EMFILE; back off so the loop does not spin.
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
