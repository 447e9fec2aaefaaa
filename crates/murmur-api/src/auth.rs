use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::{info, warn};

use murmur_db::models::{NewSession, TokenRotation};
use murmur_db::{Database, DbError, MessageArchive, SessionStore};
use murmur_types::api::{
    ApiResponse, LoginRequest, LoginResponse, RefreshResponse, RegisterRequest, RegisterResponse,
};
use murmur_types::models::{Identity, RefreshIdentity, Subject};

use crate::error::{ApiError, blocking};
use crate::password::{hash_password, verify_password};
use crate::token::{TokenClass, TokenIssuer};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub archive: Arc<dyn MessageArchive>,
    pub tokens: TokenIssuer,
}

impl AppStateInner {
    pub fn new(db: Database, archive: Arc<dyn MessageArchive>, tokens: TokenIssuer) -> AppState {
        Arc::new(Self { db, archive, tokens })
    }
}

const USERNAME_LEN: std::ops::RangeInclusive<usize> = 6..=20;
const MIN_PASSWORD_LEN: usize = 6;
const MIN_FULL_NAME_LEN: usize = 6;

fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| {
            warn!("Failed to parse request body: {}", rejection.body_text());
            ApiError::validation("Invalid request format", rejection.body_text())
        })
}

fn validate_registration(req: &RegisterRequest) -> Result<(), ApiError> {
    if !USERNAME_LEN.contains(&req.username.chars().count()) {
        return Err(ApiError::validation(
            "Validation failed",
            "username must be between 6 and 20 characters",
        ));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(
            "Validation failed",
            "password must be at least 6 characters",
        ));
    }
    if req.full_name.trim().chars().count() < MIN_FULL_NAME_LEN {
        return Err(ApiError::validation(
            "Validation failed",
            "full_name must be at least 6 characters",
        ));
    }
    Ok(())
}

/// POST /user/register
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = parse_body(payload)?;
    validate_registration(&req)?;

    let user = blocking(move || {
        let password_hash = hash_password(&req.password)
            .map_err(|e| ApiError::internal("Failed to create user", e))?;

        state
            .db
            .create_user(&req.username, &password_hash, &req.full_name)
            .map_err(|e| match e {
                DbError::Duplicate(_) => {
                    ApiError::validation("Validation failed", "username is already taken")
                }
                e => ApiError::internal("Failed to create user", e),
            })
    })
    .await?;

    info!("Registered user {}", user.username);

    Ok(Json(ApiResponse::ok(RegisterResponse {
        username: user.username,
        full_name: user.full_name,
    })))
}

/// POST /user/login
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = parse_body(payload)?;
    if req.username.is_empty() || req.password.is_empty() {
        return Err(ApiError::validation(
            "Validation failed",
            "username and password are required",
        ));
    }

    let now = Utc::now();

    let response = blocking(move || {
        let user = state
            .db
            .get_user_by_username(&req.username)
            .map_err(|e| ApiError::internal("Internal server error", e))?
            .ok_or(ApiError::NotFound("User not found"))?;

        if !verify_password(&req.password, &user.password) {
            warn!("Invalid credentials for {}", user.username);
            return Err(ApiError::Unauthorized("Invalid credentials"));
        }

        let subject = Subject {
            username: user.username.clone(),
            full_name: user.full_name.clone(),
        };
        let access = state
            .tokens
            .issue(&subject, TokenClass::Access, now)
            .map_err(|e| ApiError::internal("Internal server error", e))?;
        let refresh = state
            .tokens
            .issue(&subject, TokenClass::Refresh, now)
            .map_err(|e| ApiError::internal("Internal server error", e))?;

        state
            .db
            .create_session(&NewSession {
                user_id: user.id,
                access_token: access.token.clone(),
                refresh_token: refresh.token.clone(),
                access_expires_at: access.expires_at,
                refresh_expires_at: refresh.expires_at,
            })
            .map_err(|e| ApiError::internal("Failed to create session", e))?;

        Ok(LoginResponse {
            username: user.username,
            full_name: user.full_name,
            token: access.token,
            refresh_token: refresh.token,
        })
    })
    .await?;

    info!("{} logged in", response.username);
    Ok(Json(ApiResponse::ok(response)))
}

/// DELETE /user/logout (behind the access gate)
pub async fn logout(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<StatusCode, ApiError> {
    let username = identity.username.clone();
    blocking(move || {
        state
            .db
            .delete_by_access_token(&identity.access_token)
            .map_err(|e| ApiError::internal("Failed to delete session", e))
    })
    .await?;

    info!("{} logged out", username);
    Ok(StatusCode::OK)
}

/// PUT /user/refresh-token (behind the refresh gate)
pub async fn refresh_token(
    State(state): State<AppState>,
    Extension(identity): Extension<RefreshIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();

    let response = blocking(move || {
        let subject = identity.subject();
        let access = state
            .tokens
            .issue(&subject, TokenClass::Access, now)
            .map_err(|e| ApiError::internal("Failed to generate access token", e))?;
        let refresh = state
            .tokens
            .issue(&subject, TokenClass::Refresh, now)
            .map_err(|e| ApiError::internal("Failed to generate refresh token", e))?;

        let rotation = TokenRotation {
            access_token: access.token.clone(),
            refresh_token: refresh.token.clone(),
            access_expires_at: access.expires_at,
            refresh_expires_at: refresh.expires_at,
        };
        state
            .db
            .rotate(&identity.refresh_token, &rotation)
            .map_err(|e| match e {
                // Lost a race with a concurrent refresh of the same token.
                DbError::NotFound => ApiError::Unauthorized("Invalid refresh token"),
                e => ApiError::internal("Failed to update session", e),
            })?;

        Ok(RefreshResponse {
            token: access.token,
            refresh_token: refresh.token,
        })
    })
    .await?;

    Ok(Json(ApiResponse::ok(response)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(username: &str, password: &str, full_name: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.into(),
            password: password.into(),
            full_name: full_name.into(),
        }
    }

    #[test]
    fn registration_bounds() {
        assert!(validate_registration(&request("alice01", "secret", "Alice Liddell")).is_ok());
        assert!(validate_registration(&request("al", "secret", "Alice Liddell")).is_err());
        assert!(validate_registration(&request("a".repeat(21).as_str(), "secret", "Alice Liddell")).is_err());
        assert!(validate_registration(&request("alice01", "short", "Alice Liddell")).is_err());
        assert!(validate_registration(&request("alice01", "secret", "Al")).is_err());
    }
}
