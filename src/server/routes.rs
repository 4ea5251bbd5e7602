//! Router configuration for the scheduler's RPC surface.

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::AppState;

/// Create the RPC router. One router, one listener, one acceptor task:
/// the multiplexing happens inside the single axum serve loop.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/register", post(handlers::register))
        .route("/request-work", post(handlers::request_work))
        .route("/report", post(handlers::report))
        .route("/heartbeat", post(handlers::heartbeat))
        .route("/status", get(handlers::status))
        .with_state(state)
}
