//! # Error Handling for LedgerDB
//!
//! A single error enum ([`Error`]) covers every failure mode of the event log,
//! the subscription cursors and the projection machinery. Callers match on the
//! variants they can react to and propagate the rest with `?`.
//!
//! ## Rust Pattern: thiserror
//!
//! `thiserror` derives `std::error::Error` and `Display` from the
//! `#[error(...)]` attributes, and `From` conversions from `#[from]`.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Conflict | Stream version mismatch | Reload the stream and retry |
//! | Lookup | Missing cursor or projection row | Create it, or give up |
//! | Lifecycle | Catch-up on an `inline` projection | Fix the caller |
//! | Progress | Reconciliation budget exhausted | Re-run catch-up later |
//! | Internal | SQLite or JSON failure | Log and investigate |
//!
//! Every store-owned transaction is rolled back before one of these errors
//! reaches the caller.

use thiserror::Error;

use crate::types::ProjectionPhase;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in LedgerDB operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conflict Errors (Client can retry with updated data)
    // =========================================================================

    /// Optimistic concurrency conflict: the stream moved since it was read.
    ///
    /// `actual` is `None` when the stream does not exist yet. A missing
    /// stream counts as version 0, so only a non-zero expectation conflicts
    /// with it.
    ///
    /// # Recovery
    ///
    /// 1. Reload the stream
    /// 2. Re-run the business decision against the fresh events
    /// 3. Append again with the new expected version
    #[error("concurrency conflict on stream '{stream_id}': expected version {expected}, found {}", display_version(.actual))]
    ConcurrencyConflict {
        /// The stream where the conflict occurred
        stream_id: String,
        /// The version the caller expected
        expected: i64,
        /// The version actually stored
        actual: Option<i64>,
    },

    // =========================================================================
    // Lookup Errors
    // =========================================================================

    /// A projection record names a projector that this process does not host.
    #[error("unknown projector '{0}'")]
    UnknownProjector(String),

    /// No cursor row exists for this subscription name.
    #[error("subscription '{0}' not found")]
    SubscriptionNotFound(String),

    /// No projection record exists for this projector name.
    #[error("projection '{0}' not found")]
    ProjectionNotFound(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================

    /// Catch-up was invoked on a projection that is not eligible for it.
    #[error("projection '{name}' is in state '{state}' and cannot be caught up")]
    InvalidProjectionState {
        /// The projection name
        name: String,
        /// The phase found in the projection record
        state: ProjectionPhase,
    },

    /// The reconciliation loop ran out of attempts before every transaction
    /// at or below the boundary was known to be finished.
    ///
    /// # Recovery
    ///
    /// The projection is already `inline` and its catch-up cursor is kept, so
    /// running catch-up again resumes reconciliation where it stopped.
    #[error("reconciliation of projection '{name}' incomplete after {attempts} attempts (boundary transaction {boundary})")]
    ReconciliationIncomplete {
        /// The projection name
        name: String,
        /// The transaction id recorded at the inline flip
        boundary: i64,
        /// How many reconciliation attempts were made
        attempts: u32,
    },

    /// `append` was called with no events.
    #[error("cannot append an empty list of events to stream '{0}'")]
    EmptyAppend(String),

    /// Transaction control was used out of order, e.g. `commit` without `begin`.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Another `Database` handle, in this process or another one, already
    /// holds the file.
    ///
    /// # Recovery
    ///
    /// Share one handle (it is `Clone`) instead of opening the file twice.
    #[error("database '{}' is already open by another handle", .0.display())]
    AlreadyOpen(std::path::PathBuf),

    /// A background worker was cancelled or went away before finishing.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Internal Errors (Investigate and fix)
    // =========================================================================

    /// A user-supplied projector failed.
    #[error("projector failed: {0}")]
    Projector(String),

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// `#[from]` generates `impl From<rusqlite::Error> for Error`, which is
    /// what lets `?` convert driver errors on the way out.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure outside SQLite, e.g. on the lock file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted subscription query or an event payload did not (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Schema version mismatch or corrupted metadata.
    #[error("schema error: {0}")]
    Schema(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
}

fn display_version(version: &Option<i64>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "no stream".to_string(),
    }
}

impl Error {
    /// Wraps any failure raised by projector code.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// fn project(&self, conn: &Connection, event: &PersistedEvent) -> Result<()> {
    ///     let payload: Deposit = event.decode_json()?;
    ///     if payload.amount < 0 {
    ///         return Err(Error::projector("negative deposit"));
    ///     }
    ///     Ok(())
    /// }
    /// ```
    pub fn projector(message: impl std::fmt::Display) -> Self {
        Error::Projector(message.to_string())
    }

    /// Returns true for errors that a caller resolves by reloading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let conflict = Error::ConcurrencyConflict {
            stream_id: "account-42".to_string(),
            expected: 1,
            actual: Some(3),
        };
        assert_eq!(
            conflict.to_string(),
            "concurrency conflict on stream 'account-42': expected version 1, found 3"
        );

        let missing = Error::ConcurrencyConflict {
            stream_id: "account-7".to_string(),
            expected: 4,
            actual: None,
        };
        assert_eq!(
            missing.to_string(),
            "concurrency conflict on stream 'account-7': expected version 4, found no stream"
        );

        let state = Error::InvalidProjectionState {
            name: "balances".to_string(),
            state: ProjectionPhase::Inline,
        };
        assert_eq!(
            state.to_string(),
            "projection 'balances' is in state 'inline' and cannot be caught up"
        );
    }

    /// `?` on a rusqlite error lands in `Error::Sqlite`.
    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
        assert!(!our_err.is_conflict());
    }
}
