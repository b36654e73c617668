//! API route modules.

pub mod health;
pub mod segments;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router: health under `/api/health`, everything else
/// (playlists, segments, full video) nested by source id at the root.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/health", health::router())
        .merge(segments::router())
        .with_state(state)
}
