//! HTTP surface of Murmur: registration, login, token rotation, logout and
//! message history, plus the token issuer and the auth gate they share with
//! the realtime gateway.

pub mod auth;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod password;
pub mod rate_limit;
pub mod router;
pub mod token;

pub use auth::{AppState, AppStateInner};
pub use error::ApiError;
pub use router::router;
