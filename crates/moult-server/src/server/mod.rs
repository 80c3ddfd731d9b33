//! Handoff orchestrator.
//!
//! Drives one process generation through
//! `Starting → Running → Draining → (Exiting | Respawning)`:
//!
//! - **Starting**: restore the snapshot, register handlers, open the
//!   listener. Both queues are paused.
//! - **Running**: the query queue is resumed first, then the command queue.
//! - **Draining** (stop or restart signal): pause both queues, cancel the
//!   dispatch context, wait for every in-flight dispatch, then stop the
//!   front end and wait for open connections to close.
//! - **Exiting**: save the snapshot and return.
//! - **Respawning**: save the snapshot, launch a successor that inherits the
//!   listening socket and return once the launch succeeded. If the launch
//!   fails the restart is aborted and the generation goes back to Running.
//!
//! Signals arriving while a sequence is in progress are logged and dropped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use moult_cqrs::{
    spawn_command_worker, spawn_query_worker, BusError, Command, CommandBus, DispatchContext,
    Query, QueryBus, WorkQueue,
};
use moult_handoff::{
    DrainTracker, HandoffSignal, InheritError, InheritedListeners, Respawn, SnapshotStore,
    TrackingListener,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::state::{self, Counters, SharedState};

mod acceptor;
mod routes;

use acceptor::HandoffAcceptor;
use routes::{create_router, FrontEndState};

/// Name under which the HTTP listener is passed to the successor.
pub const LISTENER_NAME: &str = "http";

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting,
    Running,
    Draining,
    Exiting,
    Respawning,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Exiting => "exiting",
            Phase::Respawning => "respawning",
        };
        f.write_str(name)
    }
}

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Drained and saved; nothing else serves the socket.
    Stopped,
    /// Drained and saved; the successor owns the socket now.
    Respawned { pid: u32 },
}

/// Open the listening socket: inherited on restart, freshly bound otherwise.
pub async fn open_listener(config: &ServerConfig) -> Result<TrackingListener> {
    let connections = DrainTracker::new("connections");

    if !config.inherit_listener {
        return Ok(TrackingListener::bind(config.listen, connections).await?);
    }

    let mut inherited = InheritedListeners::from_env()?.ok_or(InheritError::NothingInherited)?;
    let socket = inherited.take(LISTENER_NAME)?;
    inherited.finish()?;
    info!(
        addr = ?socket.local_addr().ok(),
        "Inherited listener from parent process (graceful restart)"
    );
    Ok(TrackingListener::new(socket, connections))
}

/// One running front-end generation.
struct FrontEnd {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl FrontEnd {
    /// End the accept loop and release requests waiting on paused queues.
    ///
    /// Open connections finish in the background; their drain is observed
    /// through the listener.
    fn stop(self) {
        self.stop.cancel();
        drop(self.task);
    }
}

/// Owns every piece of one process generation.
pub struct Orchestrator {
    listener: TrackingListener,
    in_flight: DrainTracker,
    dispatch: DispatchContext,
    commands: WorkQueue<Command>,
    queries: WorkQueue<Query>,
    state: SharedState,
    store: SnapshotStore<Counters>,
    respawner: Box<dyn Respawn>,
    drain_timeout: Duration,
    phase: watch::Sender<Phase>,
}

impl Orchestrator {
    /// Restore state and wire up the pipeline with the application handlers.
    ///
    /// A corrupt or unreadable snapshot is fatal.
    pub async fn start(
        config: &ServerConfig,
        listener: TrackingListener,
        respawner: Box<dyn Respawn>,
    ) -> Result<Self> {
        Self::start_with(config, listener, respawner, state::buses).await
    }

    async fn start_with<F>(
        config: &ServerConfig,
        listener: TrackingListener,
        respawner: Box<dyn Respawn>,
        buses: F,
    ) -> Result<Self>
    where
        F: FnOnce(&SharedState) -> Result<(CommandBus, QueryBus), BusError>,
    {
        let (phase, _) = watch::channel(Phase::Starting);

        let store = SnapshotStore::<Counters>::json(&config.snapshot_path);
        let restored = store.restore().await?;
        info!(
            found = restored.found,
            handled_commands = restored.state.handled_commands,
            "State restored"
        );
        let state: SharedState = Arc::new(RwLock::new(restored.state));

        let (command_bus, query_bus) = buses(&state)?;
        info!(
            commands = ?command_bus.names(),
            queries = ?query_bus.names(),
            "Handlers registered"
        );

        let in_flight = DrainTracker::new("in-flight");
        let dispatch = DispatchContext::new();
        let (commands, command_rx) = WorkQueue::new("commands", in_flight.clone());
        let (queries, query_rx) = WorkQueue::new("queries", in_flight.clone());
        spawn_command_worker(Arc::new(command_bus), command_rx, dispatch.clone());
        spawn_query_worker(Arc::new(query_bus), query_rx, dispatch.clone());

        Ok(Self {
            listener,
            in_flight,
            dispatch,
            commands,
            queries,
            state,
            store,
            respawner,
            drain_timeout: config.drain_timeout,
            phase,
        })
    }

    /// Serve until a stop signal, or until a restart handed the socket over.
    pub async fn run(self, mut signals: mpsc::Receiver<HandoffSignal>) -> Result<Exit> {
        let mut front = self.open_front_end();
        self.resume_queues()?;
        self.set_phase(Phase::Running);
        info!(addr = ?self.listener.local_addr().ok(), "Serving");

        loop {
            let signal = match signals.recv().await {
                Some(signal) => signal,
                None => {
                    warn!("Signal source closed, stopping");
                    HandoffSignal::Stop
                }
            };

            self.drain(front, &mut signals).await;
            self.save_snapshot().await;

            if signal == HandoffSignal::Stop {
                self.set_phase(Phase::Exiting);
                info!("Graceful shutdown complete");
                return Ok(Exit::Stopped);
            }

            self.set_phase(Phase::Respawning);
            let fd = match self.listener.export_handle() {
                Ok(fd) => fd,
                Err(e) => {
                    error!(error = %e, "Cannot hand off listener, falling back to plain shutdown");
                    self.set_phase(Phase::Exiting);
                    return Ok(Exit::Stopped);
                }
            };

            match self.respawner.respawn(fd, LISTENER_NAME) {
                Ok(pid) => {
                    info!(pid, "Successor launched, handing off");
                    return Ok(Exit::Respawned { pid });
                }
                Err(e) => {
                    error!(error = %e, "Successor launch failed, restart aborted");
                    front = self.abort_restart()?;
                }
            }
        }
    }

    /// Pause intake, wait for in-flight work, then for open connections.
    async fn drain(&self, front: FrontEnd, signals: &mut mpsc::Receiver<HandoffSignal>) {
        self.set_phase(Phase::Draining);
        self.commands.pause();
        self.queries.pause();
        self.dispatch.cancel();

        info!(in_flight = self.in_flight.outstanding(), "Waiting for in-flight work");
        ignore_signals_until(signals, self.in_flight.wait_idle()).await;
        info!("In-flight work drained");

        front.stop();
        info!(
            connections = self.listener.active_connections(),
            "Waiting for open connections"
        );
        let drained = ignore_signals_until(signals, self.listener.shutdown(self.drain_timeout)).await;
        if !drained {
            warn!(
                remaining = self.listener.active_connections(),
                "Connection drain timed out, continuing"
            );
        }
    }

    /// Go back to serving on the same socket after a failed launch.
    fn abort_restart(&self) -> Result<FrontEnd> {
        self.dispatch.renew();
        self.listener.resume_accepting();
        let front = self.open_front_end();
        self.resume_queues()?;
        self.set_phase(Phase::Running);
        info!("Resumed serving after aborted restart");
        Ok(front)
    }

    /// Queries first, then commands.
    fn resume_queues(&self) -> Result<()> {
        let queries = self.queries.resume()?;
        let commands = self.commands.resume()?;
        debug!(queries, commands, "Queues resumed");
        Ok(())
    }

    fn open_front_end(&self) -> FrontEnd {
        let stop = CancellationToken::new();
        let app = create_router(Arc::new(FrontEndState {
            commands: self.commands.clone(),
            queries: self.queries.clone(),
            phase: self.phase.subscribe(),
            stop: stop.clone(),
        }));
        let acceptor = HandoffAcceptor::new(self.listener.acceptor());

        let shutdown = stop.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(acceptor, app)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                    info!("HTTP server received shutdown signal, draining connections");
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "HTTP server failed");
            }
        });

        FrontEnd { stop, task }
    }

    /// Best effort: a failed save is logged and the sequence continues.
    async fn save_snapshot(&self) {
        let state = self.state.read().await.clone();
        if let Err(e) = self.store.save(&state).await {
            error!(error = %e, "Failed to save snapshot");
        }
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        info!(from = %previous, to = %phase, "Phase changed");
    }
}

/// Await `fut`, logging and dropping any signal that arrives meanwhile.
async fn ignore_signals_until<F: Future>(
    signals: &mut mpsc::Receiver<HandoffSignal>,
    fut: F,
) -> F::Output {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            Some(signal) = signals.recv() => {
                warn!(?signal, "Handoff already in progress, ignoring signal");
            }
        }
    }
}
