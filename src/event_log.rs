//! # Event Log
//!
//! Appends with optimistic concurrency, per-stream loads, and the global
//! read that every subscription and projection is built on.
//!
//! ## Append Path
//!
//! ```text
//! append(stream, events)
//!   │
//!   ├─ lock the stream row          UPDATE es_stream ... (takes the write lock)
//!   ├─ check expected version       mismatch → ConcurrencyConflict, rollback
//!   ├─ insert one row per event     version = previous + 1, starting at 0
//!   ├─ upsert es_stream             version of the last event
//!   └─ run inline projections       same transaction
//! ```
//!
//! Everything happens inside one [`Session::transaction`], so an append is
//! all or nothing, and an append inside a caller's transaction commits with
//! it.
//!
//! ## Gap-Free Reads
//!
//! Transactions get their id when they begin but can commit in any order.
//! Suppose transaction 7 is still open when transaction 8 commits:
//!
//! ```text
//!   committed:  ... 5 6 _ 8        (7 still open)
//!   reader A:   sees 8, acks 8:x
//!   7 commits:  ... 5 6 7 8
//!   reader A:   continues after 8:x and never sees 7
//! ```
//!
//! A gap-free read (`allow_gaps = false`) therefore only returns events whose
//! transaction id is below the oldest in-flight id, the *xmin*. The ceiling
//! is taken once when [`EventStore::read`] is called, so a long iteration
//! never skips past a transaction that commits midway.

use std::collections::VecDeque;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tracing::debug;

use crate::projection::ProjectionRegistry;
use crate::storage::Session;
use crate::types::{Event, GlobalPosition, PersistedEvent, StreamId, SubscriptionQuery};
use crate::{Error, Result};

const EVENT_COLUMNS: &str = "id, transaction_id, stream_id, version, event_type, data";

// =============================================================================
// Event Store
// =============================================================================

/// The event log.
///
/// Holds no connection of its own; every call takes the [`Session`] to run
/// on. Cloning is cheap.
#[derive(Clone, Default)]
pub struct EventStore {
    projections: Option<Arc<ProjectionRegistry>>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("inline_projections", &self.projections.is_some())
            .finish()
    }
}

impl EventStore {
    /// An event store without inline projections.
    pub fn new() -> Self {
        Self::default()
    }

    /// An event store that runs `projections` inline on every append.
    pub fn with_projections(projections: Arc<ProjectionRegistry>) -> Self {
        Self {
            projections: Some(projections),
        }
    }

    pub fn projections(&self) -> Option<&Arc<ProjectionRegistry>> {
        self.projections.as_ref()
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Appends `events` to a stream.
    ///
    /// If `stream_id.version` is set, the stream must currently be at exactly
    /// that version (the version of its last event). A stream that does not
    /// exist yet counts as version 0, so `Some(0)` also accepts a new stream.
    /// Without a version the append is unconditional.
    ///
    /// # Errors
    ///
    /// - `Error::EmptyAppend` if `events` is empty
    /// - `Error::ConcurrencyConflict` if the expected version doesn't match;
    ///   nothing is written
    /// - any error raised by an inline projector; nothing is written
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use ledgerdb::{Database, Event, EventStore, StreamId};
    ///
    /// let db = Database::open("events.db")?;
    /// let session = db.session()?;
    /// let store = EventStore::new();
    ///
    /// let stream = StreamId::new("account-1");
    /// let written = store.append(&session, &stream, &[Event::new("Opened", b"{}".to_vec())])?;
    /// assert_eq!(written[0].version(), 0);
    ///
    /// // Conditional append on top of version 0.
    /// store.append(&session, &stream.with_version(0), &[Event::new("Deposited", b"{}".to_vec())])?;
    /// # Ok::<(), ledgerdb::Error>(())
    /// ```
    pub fn append(
        &self,
        session: &Session,
        stream_id: &StreamId,
        events: &[Event],
    ) -> Result<Vec<PersistedEvent>> {
        if events.is_empty() {
            return Err(Error::EmptyAppend(stream_id.id.clone()));
        }

        session.transaction(|s| {
            let conn = s.conn();
            let transaction_id = s
                .transaction_id()
                .ok_or_else(|| Error::Transaction("append outside a transaction".to_string()))?;

            // A write statement first, so the version read below happens
            // under the write lock even inside a deferred transaction.
            conn.execute(
                "UPDATE es_stream SET version = version WHERE stream_id = ?1",
                params![stream_id.id],
            )?;

            let current: Option<i64> = conn
                .query_row(
                    "SELECT version FROM es_stream WHERE stream_id = ?1",
                    params![stream_id.id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(expected) = stream_id.version {
                if current.unwrap_or(0) != expected {
                    return Err(Error::ConcurrencyConflict {
                        stream_id: stream_id.id.clone(),
                        expected,
                        actual: current,
                    });
                }
            }

            let mut version = current.map_or(0, |v| v + 1);
            let mut persisted = Vec::with_capacity(events.len());
            {
                let mut insert = conn.prepare_cached(
                    "INSERT INTO es_event (transaction_id, stream_id, version, event_type, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for event in events {
                    insert.execute(params![
                        transaction_id,
                        stream_id.id,
                        version,
                        event.event_type,
                        event.data
                    ])?;
                    persisted.push(PersistedEvent {
                        position: GlobalPosition::new(transaction_id, conn.last_insert_rowid()),
                        event: event.clone(),
                        stream_id: stream_id.with_version(version),
                    });
                    version += 1;
                }
            }

            conn.execute(
                "INSERT INTO es_stream (stream_id, version) VALUES (?1, ?2)
                 ON CONFLICT(stream_id) DO UPDATE SET version = excluded.version",
                params![stream_id.id, version - 1],
            )?;

            if let Some(projections) = &self.projections {
                projections.run_inline(s, &persisted)?;
            }

            debug!(
                stream_id = %stream_id.id,
                transaction_id,
                count = persisted.len(),
                last_version = version - 1,
                "appended events"
            );
            Ok(persisted)
        })
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Loads a stream in version order.
    ///
    /// With `stream_id.version = Some(v)` only events with version >= `v` are
    /// returned. A stream that doesn't exist is empty, not an error.
    pub fn load(&self, session: &Session, stream_id: &StreamId) -> Result<Vec<PersistedEvent>> {
        let mut stmt = session.conn().prepare_cached(&format!(
            "SELECT {} FROM es_event WHERE stream_id = ?1 AND version >= ?2 ORDER BY version",
            EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map(params![stream_id.id, stream_id.version.unwrap_or(0)], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Current version of a stream, `None` if it has no events.
    pub fn stream_version(&self, session: &Session, stream_id: &str) -> Result<Option<i64>> {
        let version = session
            .conn()
            .query_row(
                "SELECT version FROM es_stream WHERE stream_id = ?1",
                params![stream_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    // =========================================================================
    // Global Read
    // =========================================================================

    /// Reads the global log in `(transaction_id, sequence_number)` order.
    ///
    /// The returned iterator is lazy: it fetches
    /// [`StoreConfig::read_batch_size`](crate::StoreConfig) rows at a time
    /// and stops after `query.limit` events. It borrows the session, so the
    /// reads happen inside whatever transaction the session has open.
    ///
    /// # Rust Pattern: Iterator of Results
    ///
    /// Each fetch can fail, so the iterator yields `Result<PersistedEvent>`.
    /// Collect into `Result<Vec<_>>` to stop at the first error:
    ///
    /// ```rust,no_run
    /// # use ledgerdb::{Database, EventStore, SubscriptionQuery};
    /// # let db = Database::open("events.db")?;
    /// # let session = db.session()?;
    /// let events = EventStore::new()
    ///     .read(&session, &SubscriptionQuery::all().with_limit(100))?
    ///     .collect::<ledgerdb::Result<Vec<_>>>()?;
    /// # Ok::<(), ledgerdb::Error>(())
    /// ```
    pub fn read<'s>(&self, session: &'s Session, query: &SubscriptionQuery) -> Result<EventIter<'s>> {
        let ceiling = if query.allow_gaps {
            None
        } else {
            Some(session.snapshot_xmin())
        };

        Ok(EventIter {
            session,
            stream_ids: query.stream_ids.iter().cloned().collect(),
            ceiling,
            after: query.from.unwrap_or(GlobalPosition::START),
            remaining: query.limit,
            chunk_size: session.config().read_batch_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }
}

// =============================================================================
// Read Iterator
// =============================================================================

/// Lazy iterator returned by [`EventStore::read`].
pub struct EventIter<'s> {
    session: &'s Session,
    stream_ids: Vec<String>,
    ceiling: Option<i64>,
    after: GlobalPosition,
    remaining: Option<usize>,
    chunk_size: usize,
    buffer: VecDeque<PersistedEvent>,
    exhausted: bool,
}

impl EventIter<'_> {
    /// Transaction id ceiling applied to this read, if gap-free.
    pub fn ceiling(&self) -> Option<i64> {
        self.ceiling
    }

    fn fetch_chunk(&mut self) -> Result<()> {
        let limit = match self.remaining {
            Some(remaining) => remaining.min(self.chunk_size),
            None => self.chunk_size,
        };

        let mut sql = format!(
            "SELECT {} FROM es_event WHERE (transaction_id, id) > (?, ?)",
            EVENT_COLUMNS
        );
        let mut values = vec![
            Value::Integer(self.after.transaction_id),
            Value::Integer(self.after.sequence_number),
        ];

        if let Some(ceiling) = self.ceiling {
            sql.push_str(" AND transaction_id < ?");
            values.push(Value::Integer(ceiling));
        }

        if !self.stream_ids.is_empty() {
            let placeholders = vec!["?"; self.stream_ids.len()].join(", ");
            sql.push_str(&format!(" AND stream_id IN ({})", placeholders));
            values.extend(self.stream_ids.iter().cloned().map(Value::Text));
        }

        sql.push_str(" ORDER BY transaction_id, id LIMIT ?");
        values.push(Value::Integer(limit as i64));

        let mut stmt = self.session.conn().prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if rows.len() < limit {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.after = last.position;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= rows.len();
            if *remaining == 0 {
                self.exhausted = true;
            }
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

impl Iterator for EventIter<'_> {
    type Item = Result<PersistedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if self.remaining == Some(0) {
                self.exhausted = true;
            } else if let Err(e) = self.fetch_chunk() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Maps a row selected with [`EVENT_COLUMNS`].
fn event_from_row(row: &Row<'_>) -> rusqlite::Result<PersistedEvent> {
    let stream_id: String = row.get(2)?;
    Ok(PersistedEvent {
        position: GlobalPosition::new(row.get(1)?, row.get(0)?),
        event: Event {
            event_type: row.get(4)?,
            data: row.get(5)?,
        },
        stream_id: StreamId::new(stream_id).with_version(row.get(3)?),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, StoreConfig};

    fn test_db(config: StoreConfig) -> (tempfile::TempDir, Database) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open_with_config(dir.path().join("log.db"), config).unwrap();
        (dir, db)
    }

    fn events(n: usize) -> Vec<Event> {
        (0..n)
            .map(|i| Event::new("Counted", format!("{{\"n\":{}}}", i).into_bytes()))
            .collect()
    }

    #[test]
    fn append_assigns_versions_from_zero() {
        let (_dir, db) = test_db(StoreConfig::default());
        let session = db.session().unwrap();
        let store = EventStore::new();
        let stream = StreamId::new("s");

        let written = store.append(&session, &stream, &events(3)).unwrap();
        let versions: Vec<i64> = written.iter().map(|e| e.version()).collect();
        assert_eq!(versions, vec![0, 1, 2]);

        let tx = written[0].position.transaction_id;
        assert!(written.iter().all(|e| e.position.transaction_id == tx));
        assert!(written.windows(2).all(|w| w[0].position < w[1].position));
        assert_eq!(store.stream_version(&session, "s").unwrap(), Some(2));
    }

    #[test]
    fn empty_append_is_rejected() {
        let (_dir, db) = test_db(StoreConfig::default());
        let session = db.session().unwrap();
        let err = EventStore::new()
            .append(&session, &StreamId::new("s"), &[])
            .unwrap_err();
        assert!(matches!(err, Error::EmptyAppend(_)));
    }

    #[test]
    fn missing_stream_counts_as_version_zero() {
        let (_dir, db) = test_db(StoreConfig::default());
        let session = db.session().unwrap();
        let store = EventStore::new();

        let written = store
            .append(&session, &StreamId::new("fresh").with_version(0), &events(1))
            .unwrap();
        assert_eq!(written[0].version(), 0);

        let err = store
            .append(&session, &StreamId::new("other").with_version(3), &events(1))
            .unwrap_err();
        match err {
            Error::ConcurrencyConflict { expected, actual, .. } => {
                assert_eq!(expected, 3);
                assert_eq!(actual, None);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.stream_version(&session, "other").unwrap(), None);
    }

    /// Small chunks force several fetches; the limit still applies exactly.
    #[test]
    fn read_pages_through_chunks_and_respects_limit() {
        let (_dir, db) = test_db(StoreConfig::default().with_read_batch_size(2));
        let session = db.session().unwrap();
        let store = EventStore::new();
        for i in 0..4 {
            store
                .append(&session, &StreamId::new(format!("s-{i}")), &events(2))
                .unwrap();
        }

        let all: Vec<PersistedEvent> = store
            .read(&session, &SubscriptionQuery::all())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(all.len(), 8);
        assert!(all.windows(2).all(|w| w[0].position < w[1].position));

        let limited: Vec<PersistedEvent> = store
            .read(&session, &SubscriptionQuery::all().with_limit(5))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(limited, all[..5].to_vec());

        let after: Vec<PersistedEvent> = store
            .read(&session, &SubscriptionQuery::all().with_from(all[5].position))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(after, all[6..].to_vec());
    }

    #[test]
    fn load_returns_suffix() {
        let (_dir, db) = test_db(StoreConfig::default());
        let session = db.session().unwrap();
        let store = EventStore::new();
        let stream = StreamId::new("s");
        store.append(&session, &stream, &events(5)).unwrap();

        let suffix = store.load(&session, &stream.with_version(3)).unwrap();
        let versions: Vec<i64> = suffix.iter().map(|e| e.version()).collect();
        assert_eq!(versions, vec![3, 4]);

        assert!(store.load(&session, &StreamId::new("missing")).unwrap().is_empty());
    }
}
