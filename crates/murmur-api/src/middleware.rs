use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use tracing::{error, warn};

use murmur_db::{DbError, SessionStore};
use murmur_types::models::{Identity, RefreshIdentity};

use crate::auth::AppState;
use crate::error::{ApiError, blocking};

const UNAUTHORIZED: ApiError = ApiError::Unauthorized("Unauthorized");

/// Accept either a bare token or `Bearer <token>`.
pub fn extract_token(header_value: Option<&str>) -> Option<&str> {
    let raw = header_value?;
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    (!token.is_empty()).then_some(token)
}

fn authorization(req: &Request) -> Option<String> {
    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    extract_token(value).map(str::to_owned)
}

/// Access-token check, in order: token present, session row exists, signature
/// and issuer verify, embedded expiry strictly after `now`. Every failure is
/// the same `Unauthorized`.
pub async fn authenticate_access(
    state: &AppState,
    token: Option<String>,
    now: DateTime<Utc>,
) -> Result<Identity, ApiError> {
    let Some(token) = token else {
        warn!("No auth token");
        return Err(UNAUTHORIZED);
    };

    let lookup_state = state.clone();
    let lookup_token = token.clone();
    let session = blocking(move || Ok(lookup_state.db.find_by_access_token(&lookup_token))).await?;
    match session {
        Ok(_) => {}
        Err(DbError::NotFound) => {
            warn!("No session for presented access token");
            return Err(UNAUTHORIZED);
        }
        Err(e) => {
            error!("Failed to get user session: {}", e);
            return Err(UNAUTHORIZED);
        }
    }

    let verified = state.tokens.verify(&token).map_err(|e| {
        warn!("Invalid token: {}", e);
        UNAUTHORIZED
    })?;

    if !verified.is_live_at(now) {
        warn!("Token expired at {}", verified.expires_at);
        return Err(UNAUTHORIZED);
    }

    Ok(Identity {
        username: verified.subject.username,
        full_name: verified.subject.full_name,
        access_token: token,
    })
}

/// Refresh-token check. The session row's refresh expiry is authoritative;
/// the JWT only has to be authentic, its own `exp` is not enforced.
pub async fn authenticate_refresh(
    state: &AppState,
    token: Option<String>,
    now: DateTime<Utc>,
) -> Result<RefreshIdentity, ApiError> {
    let Some(token) = token else {
        return Err(UNAUTHORIZED);
    };

    let lookup_state = state.clone();
    let lookup_token = token.clone();
    let session = blocking(move || Ok(lookup_state.db.find_by_refresh_token(&lookup_token)))
        .await?
        .map_err(|e| {
            if !e.is_not_found() {
                error!("Failed to get session by refresh token: {}", e);
            }
            ApiError::Unauthorized("Invalid refresh token")
        })?;

    if now > session.refresh_expires_at {
        warn!("Refresh token expired at {}", session.refresh_expires_at);
        return Err(ApiError::Unauthorized("Refresh token expired"));
    }

    let verified = state
        .tokens
        .verify(&token)
        .map_err(|_| ApiError::Unauthorized("Invalid token format"))?;

    Ok(RefreshIdentity {
        username: verified.subject.username,
        full_name: verified.subject.full_name,
        refresh_token: token,
    })
}

/// Middleware guarding routes that need a live access token.
pub async fn require_access(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = authenticate_access(&state, authorization(&req), Utc::now()).await?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// Middleware guarding the token rotation route.
pub async fn require_refresh(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = authenticate_refresh(&state, authorization(&req), Utc::now()).await?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_prefix_is_optional() {
        assert_eq!(extract_token(Some("Bearer abc.def")), Some("abc.def"));
        assert_eq!(extract_token(Some("abc.def")), Some("abc.def"));
        assert_eq!(extract_token(Some("Bearer ")), None);
        assert_eq!(extract_token(Some("")), None);
        assert_eq!(extract_token(None), None);
    }
}
