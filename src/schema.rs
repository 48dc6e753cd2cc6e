//! # SQLite Schema for LedgerDB
//!
//! This module defines the tables and the [`Database`] handle that creates
//! them and hands out [`Session`]s.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  es_event                        es_stream                              │
//! │  ┌──────────────────────┐        ┌─────────────────┐                    │
//! │  │ id (PK, seq number)  │        │ stream_id (PK)  │                    │
//! │  │ transaction_id       │        │ version         │                    │
//! │  │ stream_id ───────────┼───────►└─────────────────┘                    │
//! │  │ version              │                                               │
//! │  │ event_type           │        es_subscription                        │
//! │  │ data BLOB            │        ┌─────────────────┐                    │
//! │  └──────────────────────┘        │ name (PK)       │                    │
//! │                                  │ transaction_id  │  cursor position   │
//! │  es_projection                   │ sequence_number │                    │
//! │  ┌──────────────────────┐        │ query (JSON)    │                    │
//! │  │ name (PK)            │        └─────────────────┘                    │
//! │  │ state                │                                               │
//! │  │ after_transaction_id │                                               │
//! │  └──────────────────────┘                                               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why is the global position two columns?
//!
//! Row ids are assigned in insert order, but transactions commit in a
//! different order. Sorting by `(transaction_id, id)` instead makes every
//! event of a transaction sort together, and lets a reader hold back whole
//! transactions that may still commit. See [`crate::storage`].

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use rusqlite::Connection;
use tracing::debug;

use crate::config::StoreConfig;
use crate::storage::{Session, TransactionRegistry};
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations: a mismatch is an error.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// The append-only event log.
///
/// # Columns
///
/// - `id`: Sequence number, the second half of the global position
/// - `transaction_id`: Id of the writing transaction, the first half
/// - `stream_id`, `version`: Position within the stream
/// - `event_type`: Type tag chosen by the writer
/// - `data`: Opaque payload
///
/// `AUTOINCREMENT` guarantees ids are never reused, even after the newest
/// rows are rolled back.
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS es_event (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id INTEGER NOT NULL,
    stream_id      TEXT NOT NULL,
    version        INTEGER NOT NULL,
    event_type     TEXT NOT NULL,
    data           BLOB NOT NULL
)
"#;

/// One version per stream. Backs the `load` scan and catches any append that
/// slipped past the version check.
const CREATE_EVENTS_STREAM_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS es_event_stream_version
ON es_event(stream_id, version)
"#;

/// Supports the keyset scan `WHERE (transaction_id, id) > (?, ?)`.
const CREATE_EVENTS_POSITION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS es_event_position
ON es_event(transaction_id, id)
"#;

/// Current version of every stream, i.e. the version of its last event.
const CREATE_STREAMS: &str = r#"
CREATE TABLE IF NOT EXISTS es_stream (
    stream_id TEXT PRIMARY KEY,
    version   INTEGER NOT NULL
)
"#;

/// Named subscription cursors.
///
/// `(transaction_id, sequence_number)` is the last acknowledged position and
/// `query` the JSON encoded [`SubscriptionQuery`](crate::SubscriptionQuery).
const CREATE_SUBSCRIPTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS es_subscription (
    name            TEXT PRIMARY KEY,
    transaction_id  INTEGER NOT NULL,
    sequence_number INTEGER NOT NULL,
    query           TEXT NOT NULL
)
"#;

/// Registered projections and their lifecycle phase.
const CREATE_PROJECTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS es_projection (
    name                 TEXT PRIMARY KEY,
    state                TEXT NOT NULL
                         CHECK (state IN ('catchup', 'catching_up', 'inline')),
    after_transaction_id INTEGER
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS es_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Highest transaction id recorded anywhere, used to resume id allocation.
const SELECT_MAX_TRANSACTION_ID: &str = r#"
SELECT MAX(
    COALESCE((SELECT MAX(transaction_id) FROM es_event), 0),
    COALESCE((SELECT MAX(after_transaction_id) FROM es_projection), 0),
    COALESCE((SELECT MAX(transaction_id) FROM es_subscription), 0)
)
"#;

// =============================================================================
// Database Handle
// =============================================================================

#[derive(Debug)]
struct DatabaseInner {
    path: PathBuf,
    config: StoreConfig,
    transactions: Arc<TransactionRegistry>,
}

/// A handle on one LedgerDB file.
///
/// Cloning is cheap and every clone shares the same transaction registry.
/// Only one handle can hold a file at a time: open it once and clone the
/// handle.
///
/// # Rust Pattern: Arc'd Inner Struct
///
/// The handle is a pointer to shared, immutable configuration plus the
/// registry, which does its own locking. Threads each take a clone and open
/// their own [`Session`].
#[derive(Debug, Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyOpen` if another handle holds the file
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use ledgerdb::Database;
    ///
    /// let db = Database::open("events.db")?;
    /// let session = db.session()?;
    /// # Ok::<(), ledgerdb::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens a database file with explicit settings.
    ///
    /// # Errors
    ///
    /// As [`open`](Self::open), plus `Error::Config` for invalid settings.
    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        let claim = claim(&path)?;
        let conn = Connection::open(&path)?;
        initialize(&conn)?;

        let last_transaction_id: i64 = conn.query_row(SELECT_MAX_TRANSACTION_ID, [], |row| row.get(0))?;
        debug!(path = %path.display(), last_transaction_id, "opened database");

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                path,
                config,
                transactions: Arc::new(TransactionRegistry::claimed(last_transaction_id + 1, claim)),
            }),
        })
    }

    /// Opens a new connection to the database.
    pub fn session(&self) -> Result<Session> {
        let conn = Connection::open(&self.inner.path)?;
        conn.busy_timeout(self.inner.config.busy_timeout())?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(Session::new(
            conn,
            Arc::clone(&self.inner.transactions),
            self.inner.config.clone(),
        ))
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Settings every session of this handle uses.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Oldest transaction id that may still be in flight on this database.
    pub fn snapshot_xmin(&self) -> i64 {
        self.inner.transactions.snapshot_xmin()
    }

    /// Highest transaction id assigned so far.
    pub fn max_assigned_transaction_id(&self) -> i64 {
        self.inner.transactions.snapshot_xmax() - 1
    }
}

// =============================================================================
// Initialization
// =============================================================================

/// Locks `<path>.lock` so that this becomes the only handle on `path`.
///
/// The lock is advisory and tied to the open file, so it is released when
/// the returned `File` is dropped or the process dies.
fn claim(path: &Path) -> Result<File> {
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(".lock");

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)?;

    if let Err(e) = file.try_lock_exclusive() {
        if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            return Err(Error::AlreadyOpen(path.to_path_buf()));
        }
        return Err(e.into());
    }
    Ok(file)
}

/// Creates every table and verifies the schema version.
///
/// Idempotent: every statement uses `IF NOT EXISTS`.
fn initialize(conn: &Connection) -> Result<()> {
    // WAL mode: readers don't block the writer and vice versa. The setting is
    // stored in the file, so later connections inherit it. The pragma answers
    // with the resulting mode, hence the checked variant.
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!(journal_mode = %mode, "journal mode set");
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;

    conn.execute_batch(CREATE_METADATA)?;
    conn.execute_batch(CREATE_EVENTS)?;
    conn.execute_batch(CREATE_EVENTS_STREAM_INDEX)?;
    conn.execute_batch(CREATE_EVENTS_POSITION_INDEX)?;
    conn.execute_batch(CREATE_STREAMS)?;
    conn.execute_batch(CREATE_SUBSCRIPTIONS)?;
    conn.execute_batch(CREATE_PROJECTIONS)?;

    verify_or_set_version(conn)
}

/// Reads the schema version, or sets it on a new database.
fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing = conn.query_row(
        "SELECT value FROM es_metadata WHERE key = 'schema_version'",
        [],
        |row| row.get::<_, String>(0),
    );

    match existing {
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            conn.execute(
                "INSERT INTO es_metadata (key, value) VALUES ('schema_version', ?1)",
                [SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        }
        Err(e) => Err(e.into()),
        Ok(value) => match value.parse::<i32>() {
            Ok(version) if version == SCHEMA_VERSION => Ok(()),
            Ok(version) => Err(Error::Schema(format!(
                "schema version mismatch: database has {}, expected {}",
                version, SCHEMA_VERSION
            ))),
            Err(_) => Err(Error::Schema(format!("corrupt schema version '{}'", value))),
        },
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_tables() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("schema.db")).unwrap();
        let session = db.session().unwrap();

        let tables: Vec<String> = session
            .conn()
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'es_%' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        assert_eq!(
            tables,
            vec!["es_event", "es_metadata", "es_projection", "es_stream", "es_subscription"]
        );
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reopen.db");
        Database::open(&path).unwrap();
        Database::open(&path).unwrap();
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mismatch.db");
        Database::open(&path).unwrap();

        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE es_metadata SET value = '99' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
        drop(conn);

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn projection_state_is_constrained() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("check.db")).unwrap();
        let session = db.session().unwrap();

        let result = session.conn().execute(
            "INSERT INTO es_projection (name, state) VALUES ('p', 'paused')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn fresh_database_starts_transaction_ids_at_one() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("ids.db")).unwrap();
        assert_eq!(db.max_assigned_transaction_id(), 0);
        assert_eq!(db.snapshot_xmin(), 1);
    }

    #[test]
    fn second_handle_on_same_file_is_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("claimed.db");
        let first = Database::open(&path).unwrap();

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::AlreadyOpen(ref p) if *p == path));

        // A session keeps the claim alive after its handle is gone.
        let session = first.session().unwrap();
        drop(first);
        assert!(matches!(Database::open(&path), Err(Error::AlreadyOpen(_))));

        drop(session);
        Database::open(&path).unwrap();
    }
}
