use std::path::Path;
use std::sync::Mutex;

use chrono::SecondsFormat;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use agentgraph_core::error::{AgentGraphError, Result};
use agentgraph_core::session::ExecutionSession;
use agentgraph_core::traits::SessionStore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        graph_name TEXT NOT NULL,
        status TEXT NOT NULL,
        document TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_updated
        ON sessions(updated_at DESC);";

fn db_err(e: impl std::fmt::Display) -> AgentGraphError {
    AgentGraphError::Database(e.to_string())
}

/// SQLite-backed session store.
///
/// Each session is one row holding the whole document as JSON. `graph_name`,
/// `status` and `updated_at` are duplicated into columns so listings do not
/// need to parse documents.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentGraphError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Session store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Status label of every stored session, most recently updated first.
    pub fn summaries(&self) -> Result<Vec<(String, String, String)>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare("SELECT id, graph_name, status FROM sessions ORDER BY updated_at DESC, id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

impl SessionStore for SqliteStore {
    fn save(&self, session: &ExecutionSession) -> BoxFuture<'_, Result<()>> {
        let row = serde_json::to_string(session).map(|document| {
            (
                session.id.clone(),
                session.graph_name.clone(),
                session.status.label(),
                document,
                session.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            )
        });

        Box::pin(async move {
            let (id, graph_name, status, document, updated_at) = row?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO sessions (id, graph_name, status, document, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     graph_name = excluded.graph_name,
                     status = excluded.status,
                     document = excluded.document,
                     updated_at = excluded.updated_at",
                params![id, graph_name, status, document, updated_at],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load(&self, id: &str) -> BoxFuture<'_, Result<Option<ExecutionSession>>> {
        let id = id.to_string();
        Box::pin(async move {
            let document: Option<String> = {
                let conn = self.conn.lock().map_err(db_err)?;
                conn.query_row(
                    "SELECT document FROM sessions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?
            };

            match document {
                Some(json) => {
                    let session = serde_json::from_str(&json).map_err(|e| {
                        AgentGraphError::Database(format!("Corrupt session document '{}': {}", id, e))
                    })?;
                    Ok(Some(session))
                }
                None => Ok(None),
            }
        })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sessions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(count > 0)
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let deleted = conn
                .execute("DELETE FROM sessions WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(deleted > 0)
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare("SELECT id FROM sessions ORDER BY updated_at DESC, id")
                .map_err(db_err)?;
            let ids = stmt
                .query_map([], |row| row.get(0))
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(db_err)?;
            Ok(ids)
        })
    }
}
