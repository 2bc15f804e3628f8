//! Route store backed by SQLite
//! Holds the routes table mapping each domain to its backend target

use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Number of read-only connections kept open for lookups
const READER_CONNECTIONS: usize = 4;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS routes (
        domain TEXT PRIMARY KEY,
        target TEXT NOT NULL,
        created_at TEXT NOT NULL
    )";

/// A persisted domain -> target mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub domain: String,
    pub target: String,
    pub created_at: String,
}

/// Thread-safe route store
///
/// Writes go through a single connection, SQLite serializes writers anyway.
/// Lookups take any idle connection from a small reader pool; in WAL mode
/// readers see the last committed state without waiting on the writer.
pub struct RouteStore {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    db_path: PathBuf,
}

impl RouteStore {
    /// Open (or create) the route database
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Self::connect(&db_path)?;
        writer.execute(SCHEMA, [])?;
        restrict_permissions(&db_path)?;

        let readers = (0..READER_CONNECTIONS)
            .map(|_| Self::connect(&db_path).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            db_path,
        })
    }

    fn connect(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn reader(&self) -> MutexGuard<'_, Connection> {
        for conn in &self.readers {
            if let Some(guard) = conn.try_lock() {
                return guard;
            }
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[idx].lock()
    }

    /// Get the database path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Insert or replace the target for a domain
    ///
    /// `created_at` is only set on first insert.
    pub fn upsert(&self, domain: &str, target: &str) -> Result<()> {
        if domain.is_empty() || target.is_empty() {
            return Err(Error::Validation("domain and target required".to_string()));
        }

        let created_at = chrono::Utc::now().to_rfc3339();
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO routes (domain, target, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(domain) DO UPDATE SET target = excluded.target",
            params![domain, target, created_at],
        )?;

        Ok(())
    }

    /// Delete the route for a domain. Returns whether a row existed.
    pub fn remove(&self, domain: &str) -> Result<bool> {
        if domain.is_empty() {
            return Err(Error::Validation("domain required".to_string()));
        }

        let conn = self.writer.lock();
        let affected = conn.execute("DELETE FROM routes WHERE domain = ?1", params![domain])?;

        Ok(affected > 0)
    }

    /// All routes ordered by domain
    pub fn list(&self) -> Result<Vec<Route>> {
        let conn = self.reader();
        let mut stmt =
            conn.prepare("SELECT domain, target, created_at FROM routes ORDER BY domain")?;

        let routes = stmt
            .query_map([], |row| {
                Ok(Route {
                    domain: row.get(0)?,
                    target: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(routes)
    }

    /// Target for a domain, `None` when no route exists
    pub fn lookup(&self, domain: &str) -> Result<Option<String>> {
        let conn = self.reader();

        let target = conn
            .query_row(
                "SELECT target FROM routes WHERE domain = ?1",
                params![domain],
                |row| row.get(0),
            )
            .optional()?;

        Ok(target)
    }
}

fn restrict_permissions(path: &Path) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
