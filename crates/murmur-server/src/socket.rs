use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, header},
    response::Response,
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use murmur_api::middleware::{authenticate_access, extract_token};
use murmur_api::{ApiError, AppState};
use murmur_gateway::ConnectionHub;
use murmur_gateway::connection::handle_socket;

#[derive(Clone)]
pub struct SocketState {
    pub app: AppState,
    pub hub: ConnectionHub,
    pub require_auth: bool,
}

/// Browsers cannot set headers on a WebSocket handshake, so the access
/// token may also arrive as `?token=`.
#[derive(Debug, Default, Deserialize)]
pub struct UpgradeParams {
    token: Option<String>,
}

/// Routes served on the realtime listener.
pub fn router(state: SocketState) -> Router {
    Router::new()
        .route("/message/send", get(upgrade))
        .with_state(state)
}

async fn upgrade(
    State(state): State<SocketState>,
    Query(params): Query<UpgradeParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let authenticated_as = authorize(&state, &headers, params.token).await?;
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, authenticated_as)))
}

/// `Ok(None)` when realtime auth is off, the username when it is on and the
/// access token checks out.
pub async fn authorize(
    state: &SocketState,
    headers: &HeaderMap,
    query_token: Option<String>,
) -> Result<Option<String>, ApiError> {
    if !state.require_auth {
        return Ok(None);
    }

    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let token = extract_token(from_header)
        .map(str::to_owned)
        .or_else(|| query_token.filter(|t| !t.is_empty()));

    let identity = authenticate_access(&state.app, token, Utc::now()).await?;
    info!("{} opened a realtime connection", identity.username);
    Ok(Some(identity.username))
}
