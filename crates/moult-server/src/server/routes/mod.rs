//! HTTP front end.
//!
//! One router per front-end generation. The generation's stop token is
//! cancelled once in-flight work has drained, which ends the HTTP server's
//! accept loop and releases requests still waiting on a paused queue.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use moult_cqrs::{Command, Query, WorkQueue};
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::Phase;

mod work;

/// Everything a request handler needs.
pub struct FrontEndState {
    pub commands: WorkQueue<Command>,
    pub queries: WorkQueue<Query>,
    pub phase: watch::Receiver<Phase>,
    pub stop: CancellationToken,
}

pub fn create_router(state: Arc<FrontEndState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/command", get(work::command_handler))
        .route("/query", get(work::query_handler))
        .with_state(state)
}

/// Liveness plus the orchestrator phase.
async fn health_handler(State(state): State<Arc<FrontEndState>>) -> impl IntoResponse {
    let phase = *state.phase.borrow();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "moult-server",
            "version": env!("CARGO_PKG_VERSION"),
            "phase": phase,
        })),
    )
}
