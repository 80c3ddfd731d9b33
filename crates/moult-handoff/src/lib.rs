//! # moult-handoff
//!
//! Process-lifecycle plumbing for graceful restarts: a new process
//! generation takes over the listening socket of the old one while the old
//! one drains its in-flight work.
//!
//! ## Overview
//!
//! 1. The running generation stops accepting on its [`TrackingListener`]
//!    and waits for live connections to close ([`DrainTracker`]).
//! 2. Application state is written through a [`SnapshotStore`].
//! 3. A successor is launched by a [`Respawn`] implementation with the
//!    listening socket at fd 3 and [`INHERIT_FLAG`] on its command line.
//! 4. The successor adopts the socket via [`InheritedListeners`], restores
//!    the snapshot and starts serving.
//!
//! ## Signal Conventions
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown (drain, snapshot, exit)
//! - `SIGQUIT` / `SIGUSR2`: graceful restart (drain, snapshot, launch
//!   successor, exit)
//!
//! ## Environment Variables
//!
//! - `LISTEN_FDS`: number of inherited file descriptors (starting at fd 3)
//! - `LISTEN_FD_NAMES`: colon-separated names for each inherited fd
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS).

#[cfg(not(unix))]
compile_error!("moult-handoff requires a Unix platform (Linux or macOS)");

mod listener;
mod respawn;
mod signal;
mod snapshot;
mod tracker;

pub use listener::{
    Acceptor, InheritError, InheritedListeners, ListenerError, TrackedStream, TrackingListener,
    INHERITED_FD_START, LISTEN_FDS, LISTEN_FD_NAMES,
};
pub use respawn::{ProcessRespawner, Respawn, RespawnError, INHERIT_FLAG};
pub use signal::{watch_signals, HandoffSignal};
pub use snapshot::{CodecError, JsonCodec, Restored, SnapshotCodec, SnapshotError, SnapshotStore};
pub use tracker::{DrainGuard, DrainTracker};
