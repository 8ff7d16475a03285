//! SQLite checkpoint backend.
//!
//! A single `checkpoints` table; every write is an upsert inside its own
//! transaction, so a value is replaced whole or not at all.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use super::backend::{validate_key, CheckpointBackend, CheckpointError, CheckpointResult};

/// Open a database connection with durable write settings.
fn open_db(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = FULL;
        PRAGMA busy_timeout = 30000;
    "#,
    )?;
    Ok(conn)
}

fn init_checkpoint_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
    "#,
    )
}

/// SQLite-backed checkpoint store. Opens a connection per operation.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointBackend {
    db_path: PathBuf,
}

impl SqliteCheckpointBackend {
    pub fn new(db_path: impl Into<PathBuf>) -> CheckpointResult<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
        }
        let conn = open_db(&db_path)?;
        init_checkpoint_table(&conn)?;
        Ok(Self { db_path })
    }

    fn connect(&self) -> CheckpointResult<Connection> {
        Ok(open_db(&self.db_path)?)
    }
}

impl CheckpointBackend for SqliteCheckpointBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn read(&self, key: &str) -> CheckpointResult<Option<String>> {
        validate_key(key)?;
        let conn = self.connect()?;
        let value = conn
            .query_row(
                "SELECT value FROM checkpoints WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write(&self, key: &str, value: &str) -> CheckpointResult<()> {
        validate_key(key)?;
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"INSERT INTO checkpoints (key, value, updated_at) VALUES (?1, ?2, ?3)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> CheckpointResult<bool> {
        validate_key(key)?;
        let conn = self.connect()?;
        let removed = conn.execute("DELETE FROM checkpoints WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    fn keys(&self, prefix: &str) -> CheckpointResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT key FROM checkpoints WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}
