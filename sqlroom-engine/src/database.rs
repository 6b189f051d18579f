//! Shared root connection and per-query cursors.
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │  Database (root conn) │── checkpoint + close on shutdown
//!                 └──────────┬───────────┘
//!            same target     │  (file path or scratch file for :memory:)
//!        ┌───────────────────┼───────────────────┐
//!        ▼                   ▼                   ▼
//!   Cursor (q1)          Cursor (q2)         Cursor (q3)
//!   own connection       own connection      own connection
//!   own interrupt        own interrupt       own interrupt
//! ```
//!
//! Every query runs on its own connection so that interrupting one statement
//! never touches another. The root connection owns the final checkpoint.
//!
//! `:memory:` is served from a WAL database in a private temporary directory
//! that is removed with the [`Database`]. Readers and a writer proceed side
//! by side; a blocked writer waits out `busy_timeout`.

use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tempfile::TempDir;

use crate::error::EngineError;

/// Path value that selects a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

/// Number of VM instructions between cancellation checks.
const PROGRESS_INTERVAL: i32 = 1000;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database file path, or `:memory:`
    pub path: String,
    /// How long a connection waits on a locked database before failing
    pub busy_timeout: Duration,
    /// Extra database files attached to every connection
    pub attachments: Vec<Attachment>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: MEMORY_PATH.to_string(),
            busy_timeout: Duration::from_millis(5000),
            attachments: Vec::new(),
        }
    }
}

impl DatabaseConfig {
    /// In-memory database with a short busy timeout.
    pub fn for_testing() -> Self {
        Self {
            busy_timeout: Duration::from_millis(100),
            ..Self::default()
        }
    }

    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn is_memory(&self) -> bool {
        self.path == MEMORY_PATH || self.path.is_empty()
    }
}

/// A database file attached under an alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub alias: String,
    pub path: PathBuf,
}

/// The shared root connection.
pub struct Database {
    /// `None` once the database has been closed
    root: Mutex<Option<Connection>>,
    open: AtomicBool,
    /// Target that every cursor opens
    target: String,
    config: DatabaseConfig,
    /// Backing directory of a `:memory:` database; dropped last
    _scratch: Option<TempDir>,
}

impl Database {
    /// Open the root connection described by `config`.
    pub fn open(config: DatabaseConfig) -> Result<Self, EngineError> {
        let (target, scratch) = if config.is_memory() {
            let dir = tempfile::Builder::new().prefix("sqlroom-").tempdir()?;
            let target = dir.path().join("memory.db").to_string_lossy().into_owned();
            (target, Some(dir))
        } else {
            prepare_file_path(Path::new(&config.path))?;
            (config.path.clone(), None)
        };

        let conn = open_connection(&target, &config)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        log::debug!("Database {target} journal mode: {mode}");

        log::info!("Opened database {}", config.path);
        Ok(Self {
            root: Mutex::new(Some(conn)),
            open: AtomicBool::new(true),
            target,
            config,
            _scratch: scratch,
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Open a fresh cursor against the same database. Blocking; call it from
    /// a worker thread.
    pub fn cursor(&self) -> Result<Cursor, EngineError> {
        self.cursor_with(CancelHandle::new())
    }

    /// Open a fresh cursor whose statements stop when `cancel` fires. A
    /// handle cancelled before this call yields a cursor that aborts its
    /// first statement.
    pub fn cursor_with(&self, cancel: CancelHandle) -> Result<Cursor, EngineError> {
        // Hold the root lock while opening so close() cannot race a new cursor.
        let root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
        if root.is_none() {
            return Err(EngineError::ConnectionNotInitialized);
        }
        let conn = open_connection(&self.target, &self.config)?;
        drop(root);
        Cursor::new(conn, cancel)
    }

    /// Run `f` against the root connection.
    pub fn with_root<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let root = self.root.lock().unwrap_or_else(PoisonError::into_inner);
        match root.as_ref() {
            Some(conn) => f(conn),
            None => Err(EngineError::ConnectionNotInitialized),
        }
    }

    /// Checkpoint the write-ahead log and close the root connection.
    ///
    /// Best-effort: failures are logged and the connection is dropped anyway.
    /// Returns false when the database was already closed.
    pub fn checkpoint_and_close(&self) -> bool {
        let conn = match self
            .root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(conn) => conn,
            None => return false,
        };
        self.open.store(false, Ordering::SeqCst);

        if let Err(e) = checkpoint(&conn) {
            log::error!("Checkpoint failed for {}: {e}", self.config.path);
        }
        if let Err((_, e)) = conn.close() {
            log::error!("Closing database {} failed: {e}", self.config.path);
        }
        log::info!("Closed database {}", self.config.path);
        true
    }
}

fn checkpoint(conn: &Connection) -> rusqlite::Result<()> {
    match conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::warn!("TRUNCATE checkpoint failed ({e}), retrying plain checkpoint");
            conn.query_row("PRAGMA wal_checkpoint", [], |_| Ok(()))
        }
    }
}

/// Create the parent directory and clear a zero-length file left behind by
/// an interrupted first run.
fn prepare_file_path(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.is_file() && meta.len() == 0 {
            log::warn!("Removing empty database file {}", path.display());
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn open_connection(target: &str, config: &DatabaseConfig) -> Result<Connection, EngineError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(target, flags)?;
    conn.busy_timeout(config.busy_timeout)?;
    for attachment in &config.attachments {
        let path = attachment.path.to_string_lossy().into_owned();
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", quote_ident(&attachment.alias)),
            [&path],
        )?;
    }
    Ok(conn)
}

/// Version string of the linked SQLite library.
pub fn sqlite_version() -> &'static str {
    rusqlite::version()
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Handle used to stop the statement running on a [`Cursor`].
///
/// Created before its cursor exists, so a query can be cancelled while it
/// still waits for a worker.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    interrupt: Arc<OnceLock<InterruptHandle>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the cursor cancelled and interrupt whatever it is running.
    ///
    /// Safe to call from any thread, any number of times.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(interrupt) = self.interrupt.get() {
            interrupt.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn bind(&self, conn: &Connection) {
        if self.interrupt.set(conn.get_interrupt_handle()).is_err() {
            log::warn!("Cancel handle is already bound to another cursor");
        }
    }
}

/// A per-query session handle.
///
/// The connection closes when the cursor is dropped, so every exit path
/// closes it exactly once.
pub struct Cursor {
    conn: Connection,
    handle: CancelHandle,
}

impl Cursor {
    fn new(conn: Connection, handle: CancelHandle) -> Result<Self, EngineError> {
        handle.bind(&conn);

        // The progress handler aborts statements that start after a cancel,
        // which a bare interrupt cannot reach.
        let check = handle.flag.clone();
        conn.progress_handler(
            PROGRESS_INTERVAL,
            Some(move || check.load(Ordering::Relaxed)),
        )?;

        Ok(Self { conn, handle })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}
