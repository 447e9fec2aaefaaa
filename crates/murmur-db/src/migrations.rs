use rusqlite::Connection;
use tracing::info;

use crate::Result;

/// Relational schema: users and their sessions.
pub fn run(conn: &Connection) -> Result<()> {
    let version = schema_version(conn, "schema_version")?;

    if version < 1 {
        info!("Database: running migration v1 (users, sessions)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                username    TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                full_name   TEXT NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE user_sessions (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id             INTEGER NOT NULL REFERENCES users(id),
                access_token        TEXT NOT NULL UNIQUE,
                refresh_token       TEXT NOT NULL UNIQUE,
                access_expires_at   INTEGER NOT NULL,
                refresh_expires_at  INTEGER NOT NULL,
                created_at          TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at          TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX idx_sessions_user ON user_sessions(user_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

/// Document schema: the append-only message history collection.
pub fn run_archive(conn: &Connection) -> Result<()> {
    // Own version table so the archive may share a file with the relational store.
    let version = schema_version(conn, "archive_schema_version")?;

    if version < 1 {
        info!("Archive: running migration v1 (message_history)");
        conn.execute_batch(
            "
            CREATE TABLE message_history (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                document    TEXT NOT NULL
            );

            INSERT INTO archive_schema_version (version) VALUES (1);
            ",
        )?;
    }

    Ok(())
}

fn schema_version(conn: &Connection, table: &str) -> Result<i64> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (version INTEGER NOT NULL);"
    ))?;

    let version = conn.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {table}"),
        [],
        |r| r.get(0),
    )?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'user_sessions')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn archive_can_share_a_file_with_relational_schema() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run_archive(&conn).unwrap();

        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'message_history'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(exists, 1);
    }
}
