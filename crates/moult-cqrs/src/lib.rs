//! # moult-cqrs
//!
//! Command/query separation for a restartable server.
//!
//! - [`Command`]s mutate state and produce no result. They are dispatched
//!   through a [`CommandBus`].
//! - [`Query`]s read state and deliver exactly one [`QueryResult`] to the
//!   submitter through a [`PendingReply`]. They are dispatched through a
//!   [`QueryBus`].
//!
//! Both kinds travel through a [`WorkQueue`] that starts paused. The
//! orchestrator resumes the queues once the server is ready and pauses them
//! again when a restart begins, so new work is buffered while in-flight work
//! drains. Forwarded items carry a [`moult_handoff::DrainGuard`] until their
//! handler returns.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use moult_cqrs::{
//!     spawn_query_worker, Arguments, DispatchContext, HandlerError, Query, QueryBus,
//!     Registered, Value, WorkQueue,
//! };
//! use moult_handoff::DrainTracker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(QueryBus::new([Registered::new("answer", |_ctx, _args| async {
//!     Ok::<_, HandlerError>(Value::Int(42))
//! })])?);
//!
//! let (queue, rx) = WorkQueue::new("queries", DrainTracker::new("in-flight"));
//! spawn_query_worker(bus, rx, DispatchContext::new());
//! queue.resume()?;
//!
//! let (query, reply) = Query::new("answer", Arguments::new());
//! queue.submit(query)?;
//! assert_eq!(reply.wait().await??, Value::Int(42));
//! # Ok(())
//! # }
//! ```

mod argument;
mod bus;
mod command;
mod dispatch;
mod query;
mod queue;

pub use argument::{ArgumentError, Arguments, Value};
pub use bus::{BusError, CommandBus, HandlerError, HandlerResult, QueryBus, Registered, Registry};
pub use command::Command;
pub use dispatch::{spawn_command_worker, spawn_query_worker, DispatchContext};
pub use query::{PendingReply, Query, QueryResult, ReplyError, Responder};
pub use queue::{QueueClosed, QueueState, Tracked, WorkQueue};
