use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

pub const STATE_FILE: &str = "state.db";

/// Local state that is not part of the identity file: which things have
/// been marked read.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMarker {
    pub name: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    /// Records `name` (a fullname such as `t3_abc`) as read. Marking twice
    /// keeps the first timestamp.
    pub fn mark_read(&self, name: &str) -> Result<bool> {
        anyhow::ensure!(!name.trim().is_empty(), "storage: name required");
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO read_markers (name, read_at) VALUES (?1, ?2)",
                params![name, Utc::now().timestamp()],
            )
            .context("storage: insert read marker")?;
        Ok(inserted > 0)
    }

    pub fn is_read(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM read_markers WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .context("storage: query read marker")?;
        Ok(found.is_some())
    }

    pub fn unmark_read(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM read_markers WHERE name = ?1", params![name])
            .context("storage: delete read marker")?;
        Ok(removed > 0)
    }

    /// Most recently read first.
    pub fn list_read(&self, limit: usize) -> Result<Vec<ReadMarker>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, read_at FROM read_markers ORDER BY read_at DESC, name LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let read_at: i64 = row.get(1)?;
            Ok(ReadMarker {
                name: row.get(0)?,
                read_at: Utc
                    .timestamp_opt(read_at, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("storage: list read markers")
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, sql) in migrations().iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp()],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS read_markers (
  name TEXT PRIMARY KEY,
  read_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_read_markers_read_at ON read_markers(read_at);
"#,
    ]
}

/// Directory for the identity file and the state database. The override
/// wins over the platform data directory.
pub fn data_dir(override_dir: Option<&Path>) -> Option<PathBuf> {
    match override_dir {
        Some(dir) => Some(dir.to_path_buf()),
        None => dirs::data_dir().map(|dir| dir.join("snoolink")),
    }
}

pub fn default_path() -> Option<PathBuf> {
    data_dir(None).map(|dir| dir.join(STATE_FILE))
}
