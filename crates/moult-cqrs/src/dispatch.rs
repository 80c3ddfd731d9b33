//! Dispatch workers draining a [`WorkQueue`](crate::WorkQueue) into a bus.
//!
//! Each worker reads forwarded items and runs every item on its own task,
//! holding the item's in-flight guard until the handler returns. A failing
//! item is logged (commands) or answered with the error (queries) and never
//! stops the worker.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{CommandBus, QueryBus};
use crate::command::Command;
use crate::query::Query;
use crate::queue::Tracked;

/// Cancellation scope handed to handlers.
///
/// [`cancel`](Self::cancel) signals running handlers that the process is
/// draining. [`renew`](Self::renew) installs a fresh scope after an aborted
/// restart so new work is not born cancelled.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    root: Arc<Mutex<CancellationToken>>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for one handler invocation.
    pub fn token(&self) -> CancellationToken {
        self.current().child_token()
    }

    pub fn cancel(&self) {
        self.current().cancel();
    }

    pub fn renew(&self) {
        let mut root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
        if root.is_cancelled() {
            *root = CancellationToken::new();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.current().is_cancelled()
    }

    fn current(&self) -> CancellationToken {
        self.root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Run commands from `rx` until every queue sender is gone.
pub fn spawn_command_worker(
    bus: Arc<CommandBus>,
    mut rx: mpsc::UnboundedReceiver<Tracked<Command>>,
    ctx: DispatchContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(tracked) = rx.recv().await {
            let (command, guard) = tracked.into_parts();
            let bus = Arc::clone(&bus);
            let token = ctx.token();
            tokio::spawn(async move {
                let (name, args) = command.into_parts();
                if let Err(e) = bus.dispatch(token, &name, args).await {
                    warn!(command = %name, error = %e, "Command failed");
                }
                drop(guard);
            });
        }
        debug!("Command worker stopped");
    })
}

/// Run queries from `rx` and deliver each result to its submitter.
pub fn spawn_query_worker(
    bus: Arc<QueryBus>,
    mut rx: mpsc::UnboundedReceiver<Tracked<Query>>,
    ctx: DispatchContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(tracked) = rx.recv().await {
            let (query, guard) = tracked.into_parts();
            let bus = Arc::clone(&bus);
            let token = ctx.token();
            tokio::spawn(async move {
                let (name, args, responder) = query.into_parts();
                let result = bus.dispatch(token, &name, args).await;
                if let Err(e) = &result {
                    debug!(query = %name, error = %e, "Query failed");
                }
                if let Err(e) = responder.respond(result) {
                    warn!(query = %name, error = %e, "Query reply dropped");
                }
                drop(guard);
            });
        }
        debug!("Query worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use moult_handoff::DrainTracker;

    use crate::argument::{Arguments, Value};
    use crate::bus::{BusError, HandlerError, Registered};
    use crate::queue::WorkQueue;

    fn query_bus() -> Arc<QueryBus> {
        Arc::new(
            QueryBus::new([
                Registered::new("multiply", |_ctx, args: Arguments| async move {
                    Ok::<_, HandlerError>(Value::Int(args.get_int("a")? * args.get_int("b")?))
                }),
                Registered::new("fail", |_ctx, _args| async move {
                    Err::<Value, HandlerError>("boom".into())
                }),
            ])
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_failing_query_does_not_stop_worker() {
        let in_flight = DrainTracker::new("in-flight");
        let (queue, rx) = WorkQueue::new("queries", in_flight.clone());
        let _worker = spawn_query_worker(query_bus(), rx, DispatchContext::new());

        let (failing, failing_reply) = Query::new("fail", Arguments::new());
        let (product, product_reply) =
            Query::new("multiply", Arguments::new().with("a", 3_i64).with("b", 5_i64));
        queue.submit(failing).unwrap();
        queue.submit(product).unwrap();
        queue.resume().unwrap();

        let err = failing_reply.wait().await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::Handler { ref name, .. } if name == "fail"));
        assert_eq!(product_reply.wait().await.unwrap().unwrap(), Value::Int(15));

        tokio::time::timeout(Duration::from_secs(1), in_flight.wait_idle())
            .await
            .expect("in-flight work settles");
    }

    #[tokio::test]
    async fn test_unregistered_query_is_answered() {
        let (queue, rx) = WorkQueue::new("queries", DrainTracker::new("in-flight"));
        let _worker = spawn_query_worker(query_bus(), rx, DispatchContext::new());
        queue.resume().unwrap();

        let (query, reply) = Query::new("divide", Arguments::new());
        queue.submit(query).unwrap();
        let err = reply.wait().await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn test_guard_held_until_command_finishes() {
        let release = Arc::new(tokio::sync::Notify::new());
        let bus = Arc::new(
            CommandBus::new([Registered::new("slow", {
                let release = Arc::clone(&release);
                move |_ctx, _args| {
                    let release = Arc::clone(&release);
                    async move {
                        release.notified().await;
                        Ok::<_, HandlerError>(())
                    }
                }
            })])
            .unwrap(),
        );

        let in_flight = DrainTracker::new("in-flight");
        let (queue, rx) = WorkQueue::new("commands", in_flight.clone());
        let _worker = spawn_command_worker(bus, rx, DispatchContext::new());
        queue.resume().unwrap();
        queue.submit(Command::new("slow", Arguments::new())).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(in_flight.outstanding(), 1);

        release.notify_one();
        tokio::time::timeout(Duration::from_secs(1), in_flight.wait_idle())
            .await
            .expect("guard released after handler returns");
    }

    #[tokio::test]
    async fn test_cancel_reaches_running_handler() {
        let bus = Arc::new(
            CommandBus::new([Registered::new("wait", |ctx: CancellationToken, _args| async move {
                ctx.cancelled().await;
                Ok::<_, HandlerError>(())
            })])
            .unwrap(),
        );

        let ctx = DispatchContext::new();
        let in_flight = DrainTracker::new("in-flight");
        let (queue, rx) = WorkQueue::new("commands", in_flight.clone());
        let _worker = spawn_command_worker(bus, rx, ctx.clone());
        queue.resume().unwrap();
        queue.submit(Command::new("wait", Arguments::new())).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(in_flight.outstanding(), 1);

        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), in_flight.wait_idle())
            .await
            .expect("handler observes cancellation");
    }

    #[test]
    fn test_renew_replaces_cancelled_scope() {
        let ctx = DispatchContext::new();
        let before = ctx.token();
        ctx.cancel();
        assert!(before.is_cancelled());
        assert!(ctx.is_cancelled());

        ctx.renew();
        assert!(!ctx.is_cancelled());
        assert!(!ctx.token().is_cancelled());
    }
}
