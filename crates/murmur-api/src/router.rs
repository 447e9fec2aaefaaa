use axum::{
    Json, Router,
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{delete, get, post, put},
};

use crate::auth::{self, AppState};
use crate::messages;
use crate::middleware::{require_access, require_refresh};
use crate::rate_limit::{RateLimiter, rate_limit};

/// HTTP API routes. `/health` sits outside the rate limiter.
pub fn router(state: AppState, limiter: RateLimiter) -> Router {
    let public_routes = Router::new()
        .route("/user/register", post(auth::register))
        .route("/user/login", post(auth::login));

    let access_routes = Router::new()
        .route("/user/logout", delete(auth::logout))
        .route("/message/history", get(messages::get_history))
        .route_layer(from_fn_with_state(state.clone(), require_access));

    let refresh_routes = Router::new()
        .route("/user/refresh-token", put(auth::refresh_token))
        .route_layer(from_fn_with_state(state.clone(), require_refresh));

    Router::new()
        .merge(public_routes)
        .merge(access_routes)
        .merge(refresh_routes)
        .layer(from_fn_with_state(limiter, rate_limit))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
