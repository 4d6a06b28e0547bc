pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use state::AppState;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/join", post(routes::call::join))
        .route("/{bot_id}/{guild_id}/leave", post(routes::call::leave))
        .route("/{bot_id}/{guild_id}/config", post(routes::call::update_config))
        .route(
            "/{bot_id}/{guild_id}/transcript",
            get(routes::stream::transcript),
        )
        .route(
            "/{bot_id}/{guild_id}/tool-messages",
            get(routes::stream::tool_messages),
        )
        .route("/{bot_id}/{guild_id}/usage", get(routes::stream::usage))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .layer(DefaultBodyLimit::max(1024 * 1024));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(api)
        .merge(health)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
