//! Uniform REST routes: four path shapes, every method, one handler.

use crate::handlers::dispatch_rest;
use crate::state::AppState;
use axum::{routing::any, Router};
use tower_http::limit::RequestBodyLimitLayer;

pub fn rest_routes(state: AppState) -> Router {
    let body_limit = state.dispatcher.config().body_limit_bytes;
    Router::new()
        .route("/:resource", any(dispatch_rest))
        .route("/:resource/:id", any(dispatch_rest))
        .route("/:resource/:id/:relation", any(dispatch_rest))
        .route("/:resource/:id/:relation/:relation_id", any(dispatch_rest))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}
