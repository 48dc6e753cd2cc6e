//! # Storage Sessions and Transaction Ids
//!
//! A [`Session`] is one SQLite connection plus the transaction bookkeeping the
//! rest of the crate relies on. Every operation in LedgerDB takes a `&Session`
//! so that it can join a transaction the caller already started.
//!
//! ## Transaction Ids on SQLite
//!
//! Global positions are `(transaction_id, sequence_number)` pairs, and the
//! gap-free read needs to know the oldest transaction that may still commit.
//! SQLite has neither a transaction counter nor a list of in-flight
//! transactions, so the [`Database`](crate::Database) keeps one in process:
//!
//! ```text
//!   begin ──► allocate id = next++ ──► active = {.., id}
//!   commit/rollback returns ──► active.remove(id)
//!
//!   snapshot_xmin = min(active)  or next if nothing is active
//!   snapshot_xmax = next
//! ```
//!
//! Ids are allocated *before* the `BEGIN` statement runs and released only
//! *after* `COMMIT` or `ROLLBACK` has returned. That ordering is what makes
//! "every id below xmin is finished and visible" true for any snapshot that
//! starts after xmin was taken.
//!
//! Inside a transaction, [`Session::snapshot_xmin`] returns the value captured
//! at `begin`. SQLite pins the read snapshot at the first statement, which
//! always runs after that capture.
//!
//! ## One Handle per File
//!
//! The registry is per `Database` handle, so two handles on one file would
//! hand out colliding ids. [`Database::open`](crate::Database::open) prevents
//! that with an exclusive lock on `<file>.lock`: a second open, from this
//! process or another one, fails with `Error::AlreadyOpen` until every
//! session of the first handle is gone.
//!
//! ## Transaction Styles
//!
//! | Method | SQL | Use |
//! |--------|-----|-----|
//! | [`Session::begin`] | `BEGIN DEFERRED` | Caller-owned unit of work |
//! | [`Session::transaction`] | `BEGIN IMMEDIATE` or `SAVEPOINT` | Store-owned writes |
//!
//! `transaction` takes the database write lock up front when it starts a
//! fresh transaction, and degrades to a savepoint when the caller already has
//! one open, exactly like the batch writer's per-command savepoints.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::fs::File;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::{Error, Result};

// =============================================================================
// Transaction Registry
// =============================================================================

#[derive(Debug)]
struct RegistryState {
    next: i64,
    active: BTreeSet<i64>,
}

/// Allocates transaction ids and tracks which ones are still in flight.
///
/// # Rust Pattern: Shared Mutable State
///
/// The registry is shared by every session of a database through an `Arc`,
/// and mutated through a `parking_lot::Mutex`. Critical sections are a few
/// set operations, so a blocking mutex is the right tool.
#[derive(Debug)]
pub(crate) struct TransactionRegistry {
    state: Mutex<RegistryState>,
    /// Exclusive lock on the database's lock file. Held for as long as any
    /// handle or session still allocates ids from this registry.
    _claim: Option<File>,
}

/// The id of an open transaction and the xmin observed when it began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TransactionScope {
    id: i64,
    xmin: i64,
}

impl TransactionRegistry {
    /// Creates a registry whose first id is `next`.
    pub(crate) fn new(next: i64) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next: next.max(1),
                active: BTreeSet::new(),
            }),
            _claim: None,
        }
    }

    /// Creates a registry that owns `claim`, the locked lock file of the
    /// database it allocates ids for.
    pub(crate) fn claimed(next: i64, claim: File) -> Self {
        Self {
            _claim: Some(claim),
            ..Self::new(next)
        }
    }

    fn begin(&self) -> TransactionScope {
        let mut state = self.state.lock();
        let id = state.next;
        state.next += 1;
        state.active.insert(id);
        let xmin = state.active.iter().next().copied().unwrap_or(id);
        TransactionScope { id, xmin }
    }

    fn finish(&self, id: i64) {
        self.state.lock().active.remove(&id);
    }

    /// Oldest in-flight id, or the next unassigned id if nothing is in flight.
    pub(crate) fn snapshot_xmin(&self) -> i64 {
        let state = self.state.lock();
        state.active.iter().next().copied().unwrap_or(state.next)
    }

    /// The next id that will be assigned.
    pub(crate) fn snapshot_xmax(&self) -> i64 {
        self.state.lock().next
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }
}

// =============================================================================
// Session
// =============================================================================

/// A connection to the store with transaction tracking.
///
/// Open one with [`Database::session`](crate::Database::session). A session
/// is `Send` but not `Sync`: move it to the thread that uses it, do not share
/// it.
///
/// # Example
///
/// ```rust,no_run
/// use ledgerdb::{Database, Event, EventStore, StreamId};
///
/// let db = Database::open("events.db")?;
/// let store = EventStore::new();
/// let session = db.session()?;
///
/// // Two appends that commit or roll back together.
/// session.begin()?;
/// store.append(&session, &StreamId::new("a"), &[Event::new("Opened", b"{}".to_vec())])?;
/// store.append(&session, &StreamId::new("b"), &[Event::new("Opened", b"{}".to_vec())])?;
/// session.commit()?;
/// # Ok::<(), ledgerdb::Error>(())
/// ```
pub struct Session {
    conn: Connection,
    transactions: Arc<TransactionRegistry>,
    config: StoreConfig,
    current: Cell<Option<TransactionScope>>,
    savepoint_depth: Cell<u32>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("transaction_id", &self.transaction_id())
            .field("savepoint_depth", &self.savepoint_depth.get())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        conn: Connection,
        transactions: Arc<TransactionRegistry>,
        config: StoreConfig,
    ) -> Self {
        Self {
            conn,
            transactions,
            config,
            current: Cell::new(None),
            savepoint_depth: Cell::new(0),
        }
    }

    /// The underlying connection.
    ///
    /// Projectors receive it to write their read models in the same
    /// transaction as the events. Do not issue `BEGIN`/`COMMIT` through it;
    /// use the session methods so transaction ids stay accurate.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Settings inherited from the [`Database`](crate::Database) handle.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // =========================================================================
    // Transaction Control
    // =========================================================================

    /// Starts a caller-owned transaction (`BEGIN DEFERRED`).
    ///
    /// The transaction id is assigned immediately, so from this point on
    /// gap-free readers in other sessions hold back every event from younger
    /// transactions until this one commits or rolls back.
    pub fn begin(&self) -> Result<()> {
        if self.current.get().is_some() {
            return Err(Error::Transaction(
                "a transaction is already open on this session".to_string(),
            ));
        }
        self.start("BEGIN DEFERRED")
    }

    /// Commits the open transaction and retires its id.
    ///
    /// A failed `COMMIT` is rolled back, so the session never stays inside a
    /// half-finished transaction.
    pub fn commit(&self) -> Result<()> {
        let scope = self.require_open("commit")?;
        let result = self.conn.execute_batch("COMMIT");
        if result.is_err() {
            // COMMIT can fail with SQLITE_BUSY and leave the transaction open.
            if !self.conn.is_autocommit() {
                if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                    warn!(transaction_id = scope.id, error = %e, "rollback after failed commit failed");
                }
            }
        }
        self.end(scope);
        result?;
        Ok(())
    }

    /// Discards the open transaction and retires its id.
    pub fn rollback(&self) -> Result<()> {
        let scope = self.require_open("rollback")?;
        let result = self.conn.execute_batch("ROLLBACK");
        self.end(scope);
        result?;
        Ok(())
    }

    /// Runs `f` atomically.
    ///
    /// Without an open transaction this is `BEGIN IMMEDIATE` … `COMMIT`, with
    /// a rollback if `f` fails. Inside an open transaction it becomes a
    /// savepoint, so a failing `f` only discards its own changes and the
    /// caller's transaction stays usable.
    ///
    /// # Rust Pattern: Closures Borrowing the Session
    ///
    /// `f` receives `&Session` back instead of capturing it, which keeps the
    /// borrow checker happy when the caller also owns the session.
    pub fn transaction<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        if self.current.get().is_some() {
            return self.savepoint(f);
        }

        self.start("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback() {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn savepoint<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let depth = self.savepoint_depth.get();
        let name = format!("ledgerdb_sp_{}", depth);
        self.conn.execute_batch(&format!("SAVEPOINT {}", name))?;

        self.savepoint_depth.set(depth + 1);
        let result = f(self);
        self.savepoint_depth.set(depth);

        match result {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE SAVEPOINT {}", name))?;
                Ok(value)
            }
            Err(e) => {
                let undo = format!("ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}", name);
                if let Err(rollback_err) = self.conn.execute_batch(&undo) {
                    warn!(savepoint = %name, error = %rollback_err, "savepoint rollback failed");
                }
                Err(e)
            }
        }
    }

    fn start(&self, sql: &str) -> Result<()> {
        let scope = self.transactions.begin();
        if let Err(e) = self.conn.execute_batch(sql) {
            self.transactions.finish(scope.id);
            return Err(e.into());
        }
        self.current.set(Some(scope));
        Ok(())
    }

    fn require_open(&self, action: &str) -> Result<TransactionScope> {
        self.current
            .get()
            .ok_or_else(|| Error::Transaction(format!("{} without an open transaction", action)))
    }

    fn end(&self, scope: TransactionScope) {
        self.current.set(None);
        self.savepoint_depth.set(0);
        self.transactions.finish(scope.id);
    }

    // =========================================================================
    // Transaction Ids and Snapshots
    // =========================================================================

    /// True between `begin` (or the start of `transaction`) and its end.
    pub fn in_transaction(&self) -> bool {
        self.current.get().is_some()
    }

    /// Id of the open transaction, or `None` outside a transaction.
    pub fn transaction_id(&self) -> Option<i64> {
        self.current.get().map(|scope| scope.id)
    }

    /// Oldest transaction id that may still be in flight.
    ///
    /// Every id strictly below it has finished, and its events are visible
    /// to this session's snapshot.
    pub fn snapshot_xmin(&self) -> i64 {
        match self.current.get() {
            Some(scope) => scope.xmin,
            None => self.transactions.snapshot_xmin(),
        }
    }

    /// The next transaction id to be assigned.
    pub fn snapshot_xmax(&self) -> i64 {
        self.transactions.snapshot_xmax()
    }

    /// Highest transaction id assigned so far.
    pub fn max_assigned_transaction_id(&self) -> i64 {
        self.transactions.snapshot_xmax() - 1
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(scope) = self.current.get() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(transaction_id = scope.id, error = %e, "rollback on drop failed");
            }
            self.end(scope);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
