//! Repository seams used by the API and the realtime gateway.
//!
//! Both traits are synchronous: the SQLite implementations block, so async
//! callers run them under `tokio::task::spawn_blocking`.

use murmur_types::events::ChatMessage;

use crate::Result;
use crate::models::{NewSession, Session, TokenRotation};

pub trait SessionStore: Send + Sync {
    fn create_session(&self, session: &NewSession) -> Result<Session>;

    /// Fails with [`crate::DbError::NotFound`] when no row carries `token`.
    fn find_by_access_token(&self, token: &str) -> Result<Session>;

    /// Fails with [`crate::DbError::NotFound`] when no row carries `token`.
    fn find_by_refresh_token(&self, token: &str) -> Result<Session>;

    /// Atomically replace both tokens and both expiries of the row whose
    /// refresh token is `old_refresh_token`.
    ///
    /// Exactly one caller can observe a given refresh token: once rotated,
    /// any retry with the same old token fails with `NotFound`.
    fn rotate(&self, old_refresh_token: &str, rotation: &TokenRotation) -> Result<()>;

    /// Revoke the session holding `access_token`. Absent rows are not an error.
    fn delete_by_access_token(&self, access_token: &str) -> Result<()>;
}

/// Append-only message log.
pub trait MessageArchive: Send + Sync {
    fn append(&self, message: &ChatMessage) -> Result<()>;

    /// Every archived message, in insertion order.
    fn list_all(&self) -> Result<Vec<ChatMessage>>;
}
