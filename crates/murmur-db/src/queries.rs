use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};

use crate::error::is_unique_violation;
use crate::models::{NewSession, Session, TokenRotation, UserRow};
use crate::store::SessionStore;
use crate::{Database, DbError, Result};

const SESSION_COLUMNS: &str =
    "id, user_id, access_token, refresh_token, access_expires_at, refresh_expires_at";

impl Database {
    // -- Users --

    pub fn create_user(&self, username: &str, password_hash: &str, full_name: &str) -> Result<UserRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, password, full_name) VALUES (?1, ?2, ?3)",
                (username, password_hash, full_name),
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DbError::Duplicate("username")
                } else {
                    e.into()
                }
            })?;

            query_user_by_username(conn, username)?.ok_or(DbError::NotFound)
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }
}

impl SessionStore for Database {
    fn create_session(&self, session: &NewSession) -> Result<Session> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_sessions
                    (user_id, access_token, refresh_token, access_expires_at, refresh_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    session.user_id,
                    session.access_token,
                    session.refresh_token,
                    session.access_expires_at.timestamp(),
                    session.refresh_expires_at.timestamp(),
                ],
            )?;

            Ok(Session {
                id: conn.last_insert_rowid(),
                user_id: session.user_id,
                access_token: session.access_token.clone(),
                refresh_token: session.refresh_token.clone(),
                access_expires_at: truncate_to_secs(session.access_expires_at),
                refresh_expires_at: truncate_to_secs(session.refresh_expires_at),
            })
        })
    }

    fn find_by_access_token(&self, token: &str) -> Result<Session> {
        self.with_conn(|conn| query_session(conn, "access_token", token))
    }

    fn find_by_refresh_token(&self, token: &str) -> Result<Session> {
        self.with_conn(|conn| query_session(conn, "refresh_token", token))
    }

    fn rotate(&self, old_refresh_token: &str, rotation: &TokenRotation) -> Result<()> {
        self.with_conn(|conn| {
            // Single conditional UPDATE: the WHERE clause is the compare, the SET
            // the swap. A stale refresh token matches nothing.
            let changed = conn.execute(
                "UPDATE user_sessions
                 SET access_token = ?1, refresh_token = ?2,
                     access_expires_at = ?3, refresh_expires_at = ?4,
                     updated_at = datetime('now')
                 WHERE refresh_token = ?5",
                rusqlite::params![
                    rotation.access_token,
                    rotation.refresh_token,
                    rotation.access_expires_at.timestamp(),
                    rotation.refresh_expires_at.timestamp(),
                    old_refresh_token,
                ],
            )?;

            if changed == 0 {
                return Err(DbError::NotFound);
            }
            Ok(())
        })
    }

    fn delete_by_access_token(&self, access_token: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM user_sessions WHERE access_token = ?1",
                [access_token],
            )?;
            Ok(())
        })
    }
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, password, full_name FROM users WHERE username = ?1",
    )?;

    let row = stmt
        .query_row([username], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                full_name: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Latest session whose `column` equals `token`.
fn query_session(conn: &Connection, column: &str, token: &str) -> Result<Session> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM user_sessions WHERE {column} = ?1 ORDER BY id DESC LIMIT 1"
    );
    let mut stmt = conn.prepare(&sql)?;

    stmt.query_row([token], session_from_row)
        .optional()?
        .ok_or(DbError::NotFound)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        access_token: row.get(2)?,
        refresh_token: row.get(3)?,
        access_expires_at: timestamp_column(row, 4)?,
        refresh_expires_at: timestamp_column(row, 5)?,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn truncate_to_secs(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
