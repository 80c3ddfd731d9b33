//! Name-to-handler registry and dispatch.
//!
//! A [`Registry`] is built once from a list of [`Registered`] handlers and
//! is immutable afterwards. Commands use `Registry<()>`, queries use
//! `Registry<Value>`.
//!
//! The registry imposes no serialization between dispatches. Handlers that
//! share state must guard it themselves.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::argument::{Arguments, Value};

/// Error returned by a handler body.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult<R> = Result<R, HandlerError>;

type BoxedHandler<R> =
    Arc<dyn Fn(CancellationToken, Arguments) -> BoxFuture<'static, HandlerResult<R>> + Send + Sync>;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("name already registered: {0}")]
    DuplicateName(String),

    #[error("not registered: {0}")]
    NotRegistered(String),

    #[error("handler {name} failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: HandlerError,
    },
}

/// Command registry.
pub type CommandBus = Registry<()>;

/// Query registry.
pub type QueryBus = Registry<Value>;

/// A handler paired with the name it answers to.
pub struct Registered<R> {
    name: String,
    handler: BoxedHandler<R>,
}

impl<R: Send + 'static> Registered<R> {
    /// Pair `handler` with `name`.
    ///
    /// The handler receives a cancellation token that fires when the
    /// process starts draining. Long-running handlers should observe it;
    /// handlers that are already running are always allowed to finish.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CancellationToken, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(move |ctx, args| handler(ctx, args).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<R> fmt::Debug for Registered<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registered")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A set of handlers indexed by name.
pub struct Registry<R> {
    handlers: HashMap<String, BoxedHandler<R>>,
}

impl<R> Registry<R> {
    /// Build the registry. Fails if two entries share a name.
    pub fn new(entries: impl IntoIterator<Item = Registered<R>>) -> Result<Self, BusError> {
        let mut handlers = HashMap::new();
        for entry in entries {
            if handlers.contains_key(&entry.name) {
                return Err(BusError::DuplicateName(entry.name));
            }
            handlers.insert(entry.name, entry.handler);
        }
        Ok(Self { handlers })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler registered under `name`.
    #[instrument(level = "debug", skip(self, ctx, args))]
    pub async fn dispatch(
        &self,
        ctx: CancellationToken,
        name: &str,
        args: Arguments,
    ) -> Result<R, BusError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| BusError::NotRegistered(name.to_string()))?;

        handler(ctx, args).await.map_err(|source| BusError::Handler {
            name: name.to_string(),
            source,
        })
    }
}

impl<R> fmt::Debug for Registry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.names())
            .finish()
    }
}
