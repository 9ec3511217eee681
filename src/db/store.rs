//! SQLite database store implementation.

use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use super::models::StorageStats;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle read connections kept around between queries.
const MAX_IDLE_READERS: usize = 4;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not found")]
    NotFound,
    #[error("Host '{0}' already exists")]
    Conflict(String),
    #[error("Invalid probe result: {0}")]
    InvalidResult(String),
}

impl DbError {
    pub(crate) fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
        )
    }
}

/// Thread-safe database store.
///
/// Writes go through a single connection; reads use their own connections
/// so they see committed WAL snapshots without waiting on the writer.
#[derive(Clone)]
pub struct Store {
    writer: Arc<Mutex<Connection>>,
    readers: Arc<ReaderPool>,
}

struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn checkout(&self) -> Result<Connection, DbError> {
        let pooled = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => {
                let conn = Connection::open(&self.path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                Ok(conn)
            }
        }
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }
    }
}

impl Store {
    /// Open (or create) the database at `path` and apply migrations.
    ///
    /// The parent directory is created if missing. An in-memory path is not
    /// supported since readers open their own connections.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(&path)?;
        init_connection(&mut conn)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: Arc::new(ReaderPool {
                path,
                idle: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Run `f` with exclusive access to the writer connection.
    pub(crate) fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let mut conn = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut conn)
    }

    /// Run `f` on a pooled read connection.
    pub(crate) fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let conn = self.readers.checkout()?;
        let result = f(&conn);
        self.readers.checkin(conn);
        result
    }

    // --- Maintenance ---

    /// Checkpoint the WAL and rebuild the database file to reclaim space
    /// freed by deletes.
    pub fn vacuum(&self) -> Result<(), DbError> {
        self.with_writer(|conn| {
            conn.execute("VACUUM", [])?;
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        })
    }

    /// Database file statistics.
    pub fn storage_stats(&self) -> Result<StorageStats, DbError> {
        self.with_reader(|conn| {
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
            let freelist_count: i64 = conn.query_row("PRAGMA freelist_count", [], |r| r.get(0))?;
            let result_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM ping_results", [], |r| r.get(0))?;
            let host_count: i64 = conn.query_row("SELECT COUNT(*) FROM hosts", [], |r| r.get(0))?;
            Ok(StorageStats {
                db_size_bytes: page_count * page_size,
                page_count,
                page_size,
                freelist_count,
                result_count,
                host_count,
            })
        })
    }
}

fn init_connection(conn: &mut Connection) -> Result<(), DbError> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!("Database is not in WAL mode (journal_mode={})", mode);
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", -64000i64)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    let report = embedded::migrations::runner()
        .run(conn)
        .map_err(|e| DbError::Migration(e.to_string()))?;
    for migration in report.applied_migrations() {
        tracing::info!("Applied migration {}", migration);
    }

    Ok(())
}
