//! Application state and the handlers that read and mutate it.

use std::sync::Arc;

use moult_cqrs::{
    Arguments, BusError, CommandBus, HandlerResult, QueryBus, Registered, Value,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The state carried across process generations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Sum of all `increment` and `add` commands handled so far.
    pub handled_commands: u64,
}

pub type SharedState = Arc<RwLock<Counters>>;

/// Build the command and query registries over `state`.
pub fn buses(state: &SharedState) -> Result<(CommandBus, QueryBus), BusError> {
    let commands = CommandBus::new([
        Registered::new("increment", {
            let state = Arc::clone(state);
            move |ctx, args| increment(Arc::clone(&state), ctx, args)
        }),
        Registered::new("add", {
            let state = Arc::clone(state);
            move |ctx, args| add(Arc::clone(&state), ctx, args)
        }),
    ])?;

    let queries = QueryBus::new([
        Registered::new("handled_commands", {
            let state = Arc::clone(state);
            move |ctx, args| handled_commands(Arc::clone(&state), ctx, args)
        }),
        Registered::new("multiply", multiply),
        Registered::new("echo", echo),
    ])?;

    Ok((commands, queries))
}

async fn increment(state: SharedState, _ctx: CancellationToken, _args: Arguments) -> HandlerResult<()> {
    let mut counters = state.write().await;
    counters.handled_commands = counters.handled_commands.saturating_add(1);
    debug!(handled_commands = counters.handled_commands, "increment");
    Ok(())
}

async fn add(state: SharedState, _ctx: CancellationToken, args: Arguments) -> HandlerResult<()> {
    let n = u64::try_from(args.get_int("n")?).map_err(|_| "n must not be negative")?;
    let mut counters = state.write().await;
    counters.handled_commands = counters.handled_commands.saturating_add(n);
    debug!(n, handled_commands = counters.handled_commands, "add");
    Ok(())
}

async fn handled_commands(
    state: SharedState,
    _ctx: CancellationToken,
    _args: Arguments,
) -> HandlerResult<Value> {
    let count = state.read().await.handled_commands;
    Ok(Value::Int(i64::try_from(count)?))
}

async fn multiply(_ctx: CancellationToken, args: Arguments) -> HandlerResult<Value> {
    let a = args.get_int("a")?;
    let b = args.get_int("b")?;
    let product = a.checked_mul(b).ok_or("product overflows")?;
    Ok(Value::Int(product))
}

async fn echo(_ctx: CancellationToken, args: Arguments) -> HandlerResult<Value> {
    Ok(Value::from(args.get_str("text")?))
}
