//! # Projections
//!
//! A projector turns events into a read model. This module defines the
//! projector traits, the name → projector map a process hosts, and the
//! [`ProjectionRegistry`] that tracks each projection's lifecycle in the
//! database and runs inline projections during appends.
//!
//! ## Lifecycle
//!
//! ```text
//!   add_projection ──► catchup ──► catching_up ──► inline
//!                          (catch-up coordinator)    (run_inline on append)
//! ```
//!
//! ## Rust Pattern: Capabilities as Enum Variants
//!
//! Some projectors own storage (a table, a file) and need to create it when
//! registered and drop it when removed. Instead of probing a trait object at
//! runtime, the caller states the capability up front by choosing a
//! [`RegisteredProjector`] variant.
//!
//! ## Delivery
//!
//! Delivery is at least once. A crash between projecting and committing, or a
//! resumed catch-up, can hand the same event to a projector twice. Projectors
//! that write through the `&Connection` they receive join the surrounding
//! transaction and are rolled back with it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::catchup::catchup_subscription_name;
use crate::config::RegistryConfig;
use crate::storage::Session;
use crate::types::{PersistedEvent, ProjectionPhase, ProjectionRecord};
use crate::{Error, Result};

// =============================================================================
// Projector Traits
// =============================================================================

/// Applies events to a read model.
///
/// `conn` is the connection of the transaction the event is delivered in.
///
/// Closures implement it too:
///
/// ```rust
/// use ledgerdb::{PersistedEvent, RegisteredProjector};
///
/// let logger = |_conn: &rusqlite::Connection, event: &PersistedEvent| -> ledgerdb::Result<()> {
///     println!("{} {}", event.stream_id, event.event_type());
///     Ok(())
/// };
/// let registered = RegisteredProjector::basic(logger);
/// ```
pub trait Projector: Send + Sync {
    fn project(&self, conn: &Connection, event: &PersistedEvent) -> Result<()>;
}

impl<F> Projector for F
where
    F: Fn(&Connection, &PersistedEvent) -> Result<()> + Send + Sync,
{
    fn project(&self, conn: &Connection, event: &PersistedEvent) -> Result<()> {
        self(conn, event)
    }
}

/// A projector that owns storage.
///
/// `set_up` runs in the transaction that registers the projection.
/// `tear_down` runs when it is removed; failures are logged and ignored.
pub trait ProjectorLifecycle: Projector {
    fn set_up(&self, conn: &Connection) -> Result<()>;
    fn tear_down(&self, conn: &Connection) -> Result<()>;
}

/// A projector together with the capabilities it supports.
#[derive(Clone)]
pub enum RegisteredProjector {
    Basic(Arc<dyn Projector>),
    WithLifecycle(Arc<dyn ProjectorLifecycle>),
}

impl RegisteredProjector {
    pub fn basic(projector: impl Projector + 'static) -> Self {
        RegisteredProjector::Basic(Arc::new(projector))
    }

    pub fn with_lifecycle(projector: impl ProjectorLifecycle + 'static) -> Self {
        RegisteredProjector::WithLifecycle(Arc::new(projector))
    }

    pub fn project(&self, conn: &Connection, event: &PersistedEvent) -> Result<()> {
        match self {
            RegisteredProjector::Basic(p) => p.project(conn, event),
            RegisteredProjector::WithLifecycle(p) => p.project(conn, event),
        }
    }

    /// Projects `events` in order, stopping at the first failure.
    pub fn project_all(&self, conn: &Connection, events: &[PersistedEvent]) -> Result<()> {
        events.iter().try_for_each(|event| self.project(conn, event))
    }

    pub fn lifecycle(&self) -> Option<&dyn ProjectorLifecycle> {
        match self {
            RegisteredProjector::Basic(_) => None,
            RegisteredProjector::WithLifecycle(p) => Some(p.as_ref()),
        }
    }
}

impl fmt::Debug for RegisteredProjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisteredProjector::Basic(_) => f.write_str("RegisteredProjector::Basic"),
            RegisteredProjector::WithLifecycle(_) => f.write_str("RegisteredProjector::WithLifecycle"),
        }
    }
}

/// The projectors hosted by this process, by projection name.
///
/// # Example
///
/// ```rust
/// use ledgerdb::{PersistedEvent, Projectors, RegisteredProjector};
///
/// let audit = |_: &rusqlite::Connection, _: &PersistedEvent| -> ledgerdb::Result<()> { Ok(()) };
/// let projectors = Projectors::new().with("audit", RegisteredProjector::basic(audit));
/// assert!(projectors.get("audit").is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Projectors {
    by_name: BTreeMap<String, RegisteredProjector>,
}

impl Projectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, projector: RegisteredProjector) -> Self {
        self.insert(name, projector);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, projector: RegisteredProjector) {
        self.by_name.insert(name.into(), projector);
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredProjector> {
        self.by_name.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

// =============================================================================
// Projection Registry
// =============================================================================

/// Persisted projection records plus the projectors that serve them.
#[derive(Debug)]
pub struct ProjectionRegistry {
    projectors: Projectors,
    config: RegistryConfig,
}

impl ProjectionRegistry {
    pub fn new(projectors: Projectors, config: RegistryConfig) -> Self {
        Self { projectors, config }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The projector hosted under `name`.
    pub fn projector(&self, name: &str) -> Result<&RegisteredProjector> {
        self.projectors
            .get(name)
            .ok_or_else(|| Error::UnknownProjector(name.to_string()))
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers a projection in `phase` and runs the projector's set-up.
    ///
    /// Registration and set-up commit together. Use
    /// [`ProjectionPhase::Catchup`] for a projector that must see the existing
    /// history, and [`ProjectionPhase::Inline`] for one that only cares about
    /// events appended from now on.
    pub fn add_projection(&self, session: &Session, name: &str, phase: ProjectionPhase) -> Result<()> {
        let projector = self.projector(name)?;

        session.transaction(|s| {
            s.conn().execute(
                "INSERT INTO es_projection (name, state, after_transaction_id) VALUES (?1, ?2, NULL)",
                params![name, phase],
            )?;
            if let Some(lifecycle) = projector.lifecycle() {
                lifecycle.set_up(s.conn())?;
            }
            Ok(())
        })?;

        info!(projection = %name, phase = %phase, "projection added");
        Ok(())
    }

    /// Deletes a projection record and its catch-up cursor, then runs the
    /// projector's tear-down.
    ///
    /// Removing a name that isn't registered, or isn't hosted here, only
    /// deletes what exists.
    pub fn remove_projection(&self, session: &Session, name: &str) -> Result<()> {
        session.transaction(|s| {
            let deleted = s
                .conn()
                .execute("DELETE FROM es_projection WHERE name = ?1", params![name])?;
            s.conn().execute(
                "DELETE FROM es_subscription WHERE name = ?1",
                params![catchup_subscription_name(name)],
            )?;
            if deleted == 0 {
                debug!(projection = %name, "no projection record to remove");
            }

            if let Some(lifecycle) = self.projectors.get(name).and_then(|p| p.lifecycle()) {
                // Savepoint: a failed tear-down must not undo the removal.
                if let Err(e) = s.transaction(|inner| lifecycle.tear_down(inner.conn())) {
                    warn!(projection = %name, error = %e, "projection tear-down failed");
                }
            }
            Ok(())
        })?;

        info!(projection = %name, "projection removed");
        Ok(())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn projection(&self, session: &Session, name: &str) -> Result<ProjectionRecord> {
        session
            .conn()
            .query_row(
                "SELECT name, state, after_transaction_id FROM es_projection WHERE name = ?1",
                params![name],
                record_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::ProjectionNotFound(name.to_string()))
    }

    /// Every projection record, ordered by name.
    pub fn projections(&self, session: &Session) -> Result<Vec<ProjectionRecord>> {
        let mut stmt = session.conn().prepare_cached(
            "SELECT name, state, after_transaction_id FROM es_projection ORDER BY name",
        )?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    // =========================================================================
    // Inline Run
    // =========================================================================

    /// Projects freshly appended events through every inline projection.
    ///
    /// Called by [`EventStore::append`](crate::EventStore::append) inside the
    /// appending transaction. A projection qualifies when it is `inline` and
    /// its boundary is unset or below the current transaction id (or the
    /// session has no transaction id). Transactions at or below the boundary
    /// belong to catch-up reconciliation instead.
    ///
    /// Projections run in name order, each over all `events` in order.
    pub fn run_inline(&self, session: &Session, events: &[PersistedEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let conn = session.conn();
        let names: Vec<String> = {
            let mut stmt = conn.prepare_cached(
                "SELECT name FROM es_projection
                 WHERE state = 'inline'
                   AND (after_transaction_id IS NULL OR ?1 IS NULL OR after_transaction_id < ?1)
                 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![session.transaction_id()], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for name in names {
            match self.projectors.get(&name) {
                Some(projector) => projector.project_all(conn, events)?,
                None if self.config.ignore_unknown_projectors => {
                    debug!(projection = %name, "skipping projection not hosted by this process");
                }
                None => return Err(Error::UnknownProjector(name)),
            }
        }
        Ok(())
    }

    // =========================================================================
    // State Transitions (catch-up)
    // =========================================================================

    /// Reads a projection record after taking the write lock on it.
    pub(crate) fn lock_projection(&self, session: &Session, name: &str) -> Result<ProjectionRecord> {
        let locked = session.conn().execute(
            "UPDATE es_projection SET state = state WHERE name = ?1",
            params![name],
        )?;
        if locked == 0 {
            return Err(Error::ProjectionNotFound(name.to_string()));
        }
        self.projection(session, name)
    }

    pub(crate) fn set_phase(
        &self,
        session: &Session,
        name: &str,
        phase: ProjectionPhase,
        after_transaction_id: Option<i64>,
    ) -> Result<()> {
        let updated = session.conn().execute(
            "UPDATE es_projection SET state = ?2, after_transaction_id = ?3 WHERE name = ?1",
            params![name, phase, after_transaction_id],
        )?;
        if updated == 0 {
            return Err(Error::ProjectionNotFound(name.to_string()));
        }
        Ok(())
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectionRecord> {
    Ok(ProjectionRecord {
        name: row.get(0)?,
        state: row.get(1)?,
        after_transaction_id: row.get(2)?,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{Database, Event, EventStore, StreamId};

    struct Counter(Arc<AtomicUsize>);

    impl Projector for Counter {
        fn project(&self, _conn: &Connection, _event: &PersistedEvent) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingTearDown;

    impl Projector for FailingTearDown {
        fn project(&self, _conn: &Connection, _event: &PersistedEvent) -> Result<()> {
            Ok(())
        }
    }

    impl ProjectorLifecycle for FailingTearDown {
        fn set_up(&self, conn: &Connection) -> Result<()> {
            conn.execute_batch("CREATE TABLE failing_model (v INTEGER)")?;
            Ok(())
        }

        fn tear_down(&self, _conn: &Connection) -> Result<()> {
            Err(Error::projector("cannot drop"))
        }
    }

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("projection.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn add_unknown_projector_fails() {
        let (_dir, db) = test_db();
        let session = db.session().unwrap();
        let registry = ProjectionRegistry::new(Projectors::new(), RegistryConfig::default());

        let err = registry
            .add_projection(&session, "ghost", ProjectionPhase::Catchup)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownProjector(name) if name == "ghost"));
        assert!(registry.projections(&session).unwrap().is_empty());
    }

    #[test]
    fn inline_projection_sees_appends() {
        let (_dir, db) = test_db();
        let session = db.session().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ProjectionRegistry::new(
            Projectors::new().with("count", RegisteredProjector::basic(Counter(Arc::clone(&count)))),
            RegistryConfig::default(),
        ));
        registry
            .add_projection(&session, "count", ProjectionPhase::Inline)
            .unwrap();

        let store = EventStore::with_projections(Arc::clone(&registry));
        store
            .append(&session, &StreamId::new("s"), &[Event::new("A", b"1".to_vec()), Event::new("B", b"2".to_vec())])
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    /// Projections in `catchup` are not run inline.
    #[test]
    fn catchup_projection_is_not_run_inline() {
        let (_dir, db) = test_db();
        let session = db.session().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ProjectionRegistry::new(
            Projectors::new().with("count", RegisteredProjector::basic(Counter(Arc::clone(&count)))),
            RegistryConfig::default(),
        ));
        registry
            .add_projection(&session, "count", ProjectionPhase::Catchup)
            .unwrap();

        EventStore::with_projections(registry)
            .append(&session, &StreamId::new("s"), &[Event::new("A", b"1".to_vec())])
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_inline_projection_fails_append_unless_ignored() {
        let (_dir, db) = test_db();
        let session = db.session().unwrap();
        session
            .conn()
            .execute("INSERT INTO es_projection (name, state) VALUES ('elsewhere', 'inline')", [])
            .unwrap();

        let strict = Arc::new(ProjectionRegistry::new(Projectors::new(), RegistryConfig::default()));
        let err = EventStore::with_projections(strict)
            .append(&session, &StreamId::new("s"), &[Event::new("A", b"1".to_vec())])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownProjector(_)));
        assert_eq!(EventStore::new().stream_version(&session, "s").unwrap(), None);

        let tolerant = Arc::new(ProjectionRegistry::new(
            Projectors::new(),
            RegistryConfig::new().with_ignore_unknown_projectors(true),
        ));
        EventStore::with_projections(tolerant)
            .append(&session, &StreamId::new("s"), &[Event::new("A", b"1".to_vec())])
            .unwrap();
    }

    #[test]
    fn remove_swallows_tear_down_failure() {
        let (_dir, db) = test_db();
        let session = db.session().unwrap();
        let registry = ProjectionRegistry::new(
            Projectors::new().with("failing", RegisteredProjector::with_lifecycle(FailingTearDown)),
            RegistryConfig::default(),
        );

        registry
            .add_projection(&session, "failing", ProjectionPhase::Catchup)
            .unwrap();
        registry.remove_projection(&session, "failing").unwrap();

        assert!(matches!(
            registry.projection(&session, "failing"),
            Err(Error::ProjectionNotFound(_))
        ));
        // Removing again is a no-op.
        registry.remove_projection(&session, "failing").unwrap();
    }

    #[test]
    fn records_are_listed_by_name() {
        let (_dir, db) = test_db();
        let session = db.session().unwrap();
        let noop = || RegisteredProjector::basic(|_: &Connection, _: &PersistedEvent| -> Result<()> { Ok(()) });
        let registry = ProjectionRegistry::new(
            Projectors::new().with("b", noop()).with("a", noop()),
            RegistryConfig::default(),
        );
        registry.add_projection(&session, "b", ProjectionPhase::Inline).unwrap();
        registry.add_projection(&session, "a", ProjectionPhase::Catchup).unwrap();

        let records = registry.projections(&session).unwrap();
        assert_eq!(
            records,
            vec![
                ProjectionRecord {
                    name: "a".into(),
                    state: ProjectionPhase::Catchup,
                    after_transaction_id: None,
                },
                ProjectionRecord {
                    name: "b".into(),
                    state: ProjectionPhase::Inline,
                    after_transaction_id: None,
                },
            ]
        );
    }
}
