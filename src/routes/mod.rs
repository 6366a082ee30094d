//! Router assembly.

pub mod common;
pub mod rest;
pub use common::common_routes;
pub use rest::rest_routes;

use crate::state::AppState;
use axum::Router;

/// Common routes plus the REST surface under the configured prefix.
pub fn app_router(state: AppState) -> Router {
    let prefix = state.dispatcher.config().route_prefix.trim_matches('/').to_string();
    let router = Router::new().merge(common_routes());
    if prefix.is_empty() {
        router.merge(rest_routes(state))
    } else {
        router.nest(&format!("/{}", prefix), rest_routes(state))
    }
}
