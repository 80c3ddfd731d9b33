//! Queries and their one-shot reply slot.
//!
//! [`Query::new`] returns the query together with a [`PendingReply`]. The
//! query travels through the work queue to a dispatch worker, which fills
//! the slot exactly once; the submitter awaits the pending reply.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::argument::{Arguments, Value};
use crate::bus::BusError;

/// What a query resolves to.
pub type QueryResult = Result<Value, BusError>;

/// Reply slot errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("reply already sent")]
    AlreadyFulfilled,

    #[error("query was dropped without a reply")]
    Abandoned,
}

/// Write half of a reply slot. Accepts one response.
pub struct Responder {
    slot: Mutex<Option<oneshot::Sender<QueryResult>>>,
}

impl Responder {
    /// Fulfil the slot.
    ///
    /// A second call is rejected with [`ReplyError::AlreadyFulfilled`]. If
    /// the submitter stopped waiting the response is discarded.
    pub fn respond(&self, result: QueryResult) -> Result<(), ReplyError> {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ReplyError::AlreadyFulfilled)?;
        let _ = sender.send(result);
        Ok(())
    }

    pub fn is_fulfilled(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("fulfilled", &self.is_fulfilled())
            .finish()
    }
}

/// Read half of a reply slot.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<QueryResult>,
}

impl PendingReply {
    /// Wait until the query has been answered.
    ///
    /// Fails with [`ReplyError::Abandoned`] if the query was dropped
    /// unanswered, e.g. while still buffered in a paused queue at exit.
    pub async fn wait(self) -> Result<QueryResult, ReplyError> {
        self.rx.await.map_err(|_| ReplyError::Abandoned)
    }
}

/// A query: a handler name, its arguments and a reply slot.
#[derive(Debug)]
pub struct Query {
    name: String,
    args: Arguments,
    responder: Responder,
}

impl Query {
    pub fn new(name: impl Into<String>, args: Arguments) -> (Self, PendingReply) {
        let (tx, rx) = oneshot::channel();
        let query = Self {
            name: name.into(),
            args,
            responder: Responder {
                slot: Mutex::new(Some(tx)),
            },
        };
        (query, PendingReply { rx })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Arguments {
        &self.args
    }

    pub fn respond(&self, result: QueryResult) -> Result<(), ReplyError> {
        self.responder.respond(result)
    }

    pub fn into_parts(self) -> (String, Arguments, Responder) {
        (self.name, self.args, self.responder)
    }
}
