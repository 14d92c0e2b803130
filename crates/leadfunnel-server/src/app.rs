use std::sync::Arc;

use axum::{http::HeaderValue, routing::get, Router};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{routes, state::AppState};

/// Construct the Axum [`Router`] with all routes and middleware attached.
///
/// CORS is permissive unless `LEADFUNNEL_CORS_ORIGINS` names the dashboard
/// origins, in which case only those are echoed back.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/health", get(routes::health::health))
        .route("/api/funnel", get(routes::funnel::get_funnel))
        .route("/api/funnel/rollups", get(routes::funnel::get_rollups))
        .layer(TraceLayer::new_for_http())
        .layer(cors.allow_methods(Any).allow_headers(Any))
        .with_state(state)
}
