//! The thin HTTP surface (`spec.md` §6): goal listing/approval/rejection,
//! scheduler status, and liveness.

mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::approval_gate::ApprovalGate;
use crate::connection_pool::ConnectionPool;
use crate::domain::ports::Store;
use crate::scheduler::Scheduler;

/// Shared state for every route handler.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub approval_gate: Arc<ApprovalGate>,
    pub scheduler: Arc<Scheduler>,
    pub connection_pool: Arc<ConnectionPool>,
}

#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
