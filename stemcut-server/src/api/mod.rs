//! HTTP API handlers for stemcut

pub mod auth;
pub mod cleanup;
pub mod download;
pub mod health;
pub mod history;
pub mod sse;
pub mod status;
pub mod upload;

pub use download::download_routes;
pub use health::health_routes;
pub use history::history_routes;
pub use sse::event_stream;
pub use status::status_routes;
pub use upload::upload_routes;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::AppState;

/// All routes; administrative ones require the API key when one is set
pub fn router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/cleanup", post(cleanup::cleanup))
        .route("/cleanup_oldest", post(cleanup::cleanup_oldest))
        .route_layer(middleware::from_fn_with_state(state, auth::require_api_key));

    Router::new()
        .merge(health_routes())
        .merge(upload_routes())
        .merge(status_routes())
        .merge(download_routes())
        .merge(history_routes())
        .merge(cleanup::cleanup_routes())
        .route("/events", get(event_stream))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
