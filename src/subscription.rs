//! # Persistent Subscriptions
//!
//! A persistent subscription is a named cursor over the global log: a stored
//! [`SubscriptionQuery`] plus the position of the last acknowledged event.
//! Consumers pull pages with [`PersistentSubscriptions::read`] and move the
//! cursor with [`PersistentSubscriptions::ack`].
//!
//! ## Read / Ack Cycle
//!
//! ```text
//!   ┌────────────── one transaction ───────────────┐
//!   │ read(name)    lock cursor row, fetch page    │
//!   │ project       apply page.events              │
//!   │ ack(page)     cursor := page.end_position    │
//!   └──────────────────────────────────────────────┘
//! ```
//!
//! Wrapping the cycle in one transaction gives exactly-once progress for
//! projectors that write through the same connection. `read` takes the write
//! lock on the cursor row, so two consumers of one name never get the same
//! page while the first one's transaction is open.
//!
//! ## Rust Concepts
//!
//! - **Keyset pagination**: the cursor stores the last position, not an
//!   offset, so a page costs the same no matter how far into the log it is.
//! - **Row values**: SQLite compares `(a, b) <= (?, ?)` lexicographically,
//!   matching the derived `Ord` of [`GlobalPosition`].

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::event_log::EventStore;
use crate::storage::Session;
use crate::types::{EventPage, GlobalPosition, SubscriptionQuery};
use crate::{Error, Result};

/// Page size used when the stored query has no limit.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

// =============================================================================
// Cursor Store
// =============================================================================

/// Named, persisted cursors over the event log.
#[derive(Debug, Clone, Default)]
pub struct PersistentSubscriptions {
    events: EventStore,
}

/// A cursor row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionCursor {
    pub name: String,
    pub position: GlobalPosition,
    pub query: SubscriptionQuery,
}

impl PersistentSubscriptions {
    pub fn new(events: EventStore) -> Self {
        Self { events }
    }

    /// Creates a cursor positioned at `query.from`, or at the start of the
    /// log.
    ///
    /// Fails with a SQLite constraint error if the name is taken.
    pub fn create(&self, session: &Session, name: &str, query: &SubscriptionQuery) -> Result<()> {
        let position = query.from.unwrap_or(GlobalPosition::START);
        let encoded = serde_json::to_string(query)?;
        session.conn().execute(
            "INSERT INTO es_subscription (name, transaction_id, sequence_number, query)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, position.transaction_id, position.sequence_number, encoded],
        )?;
        debug!(subscription = %name, position = %position, "subscription created");
        Ok(())
    }

    /// Deletes a cursor. Returns false if it didn't exist.
    pub fn delete(&self, session: &Session, name: &str) -> Result<bool> {
        let deleted = session
            .conn()
            .execute("DELETE FROM es_subscription WHERE name = ?1", params![name])?;
        Ok(deleted > 0)
    }

    pub fn exists(&self, session: &Session, name: &str) -> Result<bool> {
        let found: Option<i64> = session
            .conn()
            .query_row(
                "SELECT 1 FROM es_subscription WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The stored cursor, without locking it.
    pub fn cursor(&self, session: &Session, name: &str) -> Result<SubscriptionCursor> {
        let row: Option<(i64, i64, String)> = session
            .conn()
            .query_row(
                "SELECT transaction_id, sequence_number, query FROM es_subscription WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (transaction_id, sequence_number, query) =
            row.ok_or_else(|| Error::SubscriptionNotFound(name.to_string()))?;

        Ok(SubscriptionCursor {
            name: name.to_string(),
            position: GlobalPosition::new(transaction_id, sequence_number),
            query: serde_json::from_str(&query)?,
        })
    }

    // =========================================================================
    // Read / Ack
    // =========================================================================

    /// Locks the cursor and reads the next page after its position.
    ///
    /// The lock lasts until the session's transaction ends. Call this inside
    /// a transaction together with [`ack`](Self::ack) to hold it across the
    /// whole cycle.
    pub fn read(&self, session: &Session, name: &str) -> Result<EventPage> {
        session.transaction(|s| {
            let locked = s.conn().execute(
                "UPDATE es_subscription SET name = name WHERE name = ?1",
                params![name],
            )?;
            if locked == 0 {
                return Err(Error::SubscriptionNotFound(name.to_string()));
            }

            let cursor = self.cursor(s, name)?;
            let batch_size = cursor.query.limit.unwrap_or(DEFAULT_BATCH_SIZE);
            let query = cursor
                .query
                .clone()
                .with_from(cursor.position)
                .with_limit(batch_size);

            let events = self.events.read(s, &query)?.collect::<Result<Vec<_>>>()?;
            let end_position = events.last().map_or(cursor.position, |e| e.position);

            debug!(
                subscription = %name,
                start = %cursor.position,
                end = %end_position,
                count = events.len(),
                "read subscription page"
            );

            Ok(EventPage {
                subscription_name: cursor.name,
                events,
                start_position: cursor.position,
                end_position,
                requested_batch_size: batch_size,
            })
        })
    }

    /// Moves the cursor to `page.end_position`.
    ///
    /// The cursor only moves forward: acknowledging a page that lies behind
    /// the stored position is a no-op.
    ///
    /// # Errors
    ///
    /// `Error::SubscriptionNotFound` if the cursor was deleted.
    pub fn ack(&self, session: &Session, page: &EventPage) -> Result<()> {
        let end = page.end_position;
        session.transaction(|s| {
            let updated = s.conn().execute(
                "UPDATE es_subscription SET transaction_id = ?2, sequence_number = ?3
                 WHERE name = ?1 AND (transaction_id, sequence_number) <= (?2, ?3)",
                params![page.subscription_name, end.transaction_id, end.sequence_number],
            )?;

            if updated == 0 {
                if !self.exists(s, &page.subscription_name)? {
                    return Err(Error::SubscriptionNotFound(page.subscription_name.clone()));
                }
                debug!(subscription = %page.subscription_name, position = %end, "ignored stale ack");
            }
            Ok(())
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, Event, StreamId};

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("subscriptions.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn read_ack_cycle_moves_forward() {
        let (_dir, db) = test_db();
        let session = db.session().unwrap();
        let store = EventStore::new();
        let subs = PersistentSubscriptions::new(store.clone());

        subs.create(&session, "all", &SubscriptionQuery::all().with_limit(2))
            .unwrap();
        for i in 0..3 {
            store
                .append(&session, &StreamId::new("s"), &[Event::new("E", format!("{i}").into_bytes())])
                .unwrap();
        }

        let first = subs.read(&session, "all").unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.is_full());
        assert_eq!(first.start_position, GlobalPosition::START);
        assert_eq!(first.end_position, first.events[1].position);
        subs.ack(&session, &first).unwrap();

        let second = subs.read(&session, "all").unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second.start_position, first.end_position);
        subs.ack(&session, &second).unwrap();

        // A late ack of the first page must not rewind the cursor.
        subs.ack(&session, &first).unwrap();
        assert_eq!(
            subs.cursor(&session, "all").unwrap().position,
            second.end_position
        );

        let empty = subs.read(&session, "all").unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.end_position, empty.start_position);
    }

    #[test]
    fn missing_subscription_is_reported() {
        let (_dir, db) = test_db();
        let session = db.session().unwrap();
        let subs = PersistentSubscriptions::default();

        assert!(matches!(
            subs.read(&session, "nope"),
            Err(Error::SubscriptionNotFound(_))
        ));

        subs.create(&session, "gone", &SubscriptionQuery::all()).unwrap();
        let page = subs.read(&session, "gone").unwrap();
        assert!(subs.delete(&session, "gone").unwrap());
        assert!(!subs.delete(&session, "gone").unwrap());
        assert!(matches!(
            subs.ack(&session, &page),
            Err(Error::SubscriptionNotFound(_))
        ));
    }

    #[test]
    fn query_is_stored_as_json() {
        let (_dir, db) = test_db();
        let session = db.session().unwrap();
        let subs = PersistentSubscriptions::default();
        let query = SubscriptionQuery::for_streams(["a", "b"])
            .with_from(GlobalPosition::new(3, 7))
            .with_allow_gaps(true);

        subs.create(&session, "ab", &query).unwrap();
        let cursor = subs.cursor(&session, "ab").unwrap();
        assert_eq!(cursor.query, query);
        assert_eq!(cursor.position, GlobalPosition::new(3, 7));
    }

    #[test]
    fn default_batch_size_applies_without_limit() {
        let (_dir, db) = test_db();
        let session = db.session().unwrap();
        let subs = PersistentSubscriptions::default();
        subs.create(&session, "all", &SubscriptionQuery::all()).unwrap();

        let page = subs.read(&session, "all").unwrap();
        assert_eq!(page.requested_batch_size, DEFAULT_BATCH_SIZE);
    }
}
