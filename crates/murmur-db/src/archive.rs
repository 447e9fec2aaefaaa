use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use murmur_types::events::ChatMessage;

use crate::store::MessageArchive;
use crate::{DbError, Result, migrations};

/// Message history stored as JSON documents, one row per message.
///
/// Rows are never updated or deleted; the rowid gives the archive order.
pub struct DocumentArchive {
    conn: Mutex<Connection>,
}

impl DocumentArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrations::run_archive(&conn)?;

        info!("Message archive opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_archive(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl MessageArchive for DocumentArchive {
    fn append(&self, message: &ChatMessage) -> Result<()> {
        let document = serde_json::to_string(message)?;
        let conn = self.conn.lock().map_err(|_| DbError::Lock)?;
        conn.execute(
            "INSERT INTO message_history (document) VALUES (?1)",
            [document],
        )?;
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock().map_err(|_| DbError::Lock)?;
        let mut stmt = conn.prepare("SELECT document FROM message_history ORDER BY id ASC")?;

        let documents = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        documents
            .iter()
            .map(|doc| serde_json::from_str(doc).map_err(DbError::from))
            .collect()
    }
}
