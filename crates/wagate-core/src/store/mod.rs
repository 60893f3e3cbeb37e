//! SQLite-backed session store.
//!
//! One table keyed by `(session_id, id)` holds everything the gateway
//! persists: core credentials, per-kind Signal key material, and the
//! reserved `session-config-{sessionId}` row that lets a restart
//! re-enumerate configured sessions.
//!
//! Writes to the same `(session_id, id)` pair are serialized by the
//! connection lock with last-write-wins semantics.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// A persisted `session-config-*` row, enumerated at startup.
#[derive(Debug, Clone)]
pub struct SessionConfigRow {
    pub session_id: String,
    pub data: String,
}

/// Store connection wrapper.
///
/// Thread-safe via internal Mutex. All store operations acquire the lock.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open the store at a path, creating the schema if needed
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(Error::Store)?;
        Self::from_connection(conn)
    }

    /// Open an ephemeral in-memory store
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::Store)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS session (
                 pk_id      INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id TEXT NOT NULL,
                 id         TEXT NOT NULL,
                 data       TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 updated_at INTEGER NOT NULL,
                 UNIQUE(session_id, id)
             );
             CREATE INDEX IF NOT EXISTS idx_session_item ON session(id);",
        )
        .map_err(Error::Store)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or update a record by `(session_id, id)`
    pub fn upsert(&self, session_id: &str, id: &str, data: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO session (session_id, id, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(session_id, id)
             DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![session_id, id, data, now],
        )?;
        Ok(())
    }

    /// Fetch a record, distinguishing absence from other failures
    pub fn find_or_fail(&self, session_id: &str, id: &str) -> Result<String> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM session WHERE session_id = ?1 AND id = ?2",
                params![session_id, id],
                |row| row.get(0),
            )
            .optional()?;

        data.ok_or_else(|| Error::RecordNotFound {
            session_id: session_id.to_string(),
            item_id: id.to_string(),
        })
    }

    /// Delete a record; absent records are reported as `RecordNotFound`
    pub fn delete(&self, session_id: &str, id: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let affected = conn.execute(
            "DELETE FROM session WHERE session_id = ?1 AND id = ?2",
            params![session_id, id],
        )?;
        if affected == 0 {
            return Err(Error::RecordNotFound {
                session_id: session_id.to_string(),
                item_id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Delete every record for a session; returns the number of rows removed
    pub fn delete_session(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let affected = conn.execute(
            "DELETE FROM session WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(affected)
    }

    /// Enumerate rows whose item id starts with a prefix
    pub fn list_by_id_prefix(&self, prefix: &str) -> Result<Vec<SessionConfigRow>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT session_id, data FROM session
             WHERE id LIKE ?1 || '%'
             ORDER BY session_id",
        )?;
        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok(SessionConfigRow {
                    session_id: row.get(0)?,
                    data: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
