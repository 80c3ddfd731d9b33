//! Signal subscriptions driving the handoff sequence.
//!
//! - `SIGTERM`, `SIGINT` → [`HandoffSignal::Stop`] (drain, snapshot, exit)
//! - `SIGQUIT`, `SIGUSR2` → [`HandoffSignal::Restart`] (drain, snapshot,
//!   launch successor, exit)
//!
//! Signals are forwarded into a channel so the consumer can be driven by
//! something other than the OS in tests.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Why the handoff sequence was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffSignal {
    /// Graceful stop: drain and exit.
    Stop,
    /// Graceful restart: drain and hand the listener to a successor.
    Restart,
}

/// Subscribe to stop and restart signals.
///
/// Registration happens before this returns, so a signal delivered right
/// after the call is not lost. The forwarding task ends when the receiver
/// is dropped.
pub fn watch_signals() -> std::io::Result<mpsc::Receiver<HandoffSignal>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    let (tx, rx) = mpsc::channel(8);

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    HandoffSignal::Stop
                }
                Some(()) = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                    HandoffSignal::Stop
                }
                Some(()) = sigquit.recv() => {
                    info!("Received SIGQUIT, initiating graceful restart");
                    HandoffSignal::Restart
                }
                Some(()) = sigusr2.recv() => {
                    info!("Received SIGUSR2, initiating graceful restart");
                    HandoffSignal::Restart
                }
                else => break,
            };

            if tx.send(received).await.is_err() {
                debug!("Signal receiver dropped, stopping signal watcher");
                break;
            }
        }
    });

    Ok(rx)
}
