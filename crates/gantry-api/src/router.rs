//! API router construction

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::handlers::{self, ApiState};

/// Build the control-plane router
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/containers", get(handlers::list_containers))
        .route(
            "/containers/{guid}",
            post(handlers::reserve)
                .get(handlers::get_container)
                .delete(handlers::delete_container),
        )
        .route("/containers/{guid}/initialize", post(handlers::initialize))
        .route("/containers/{guid}/run", post(handlers::run))
        .route("/resources/remaining", get(handlers::remaining_resources))
        .route("/ping", get(handlers::ping))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
