//! # Catch-up Coordinator
//!
//! Brings a projection from "registered" to "inline" without losing or
//! duplicating events, even while other sessions keep appending.
//!
//! ## The Three Phases
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────────────────────┐
//! │  1. Drain    │──►│  2. Flip     │──►│  3. Reconcile                    │
//! │  read/ack    │   │  boundary =  │   │  project events with             │
//! │  until empty │   │  max txid,   │   │  txid <= boundary until every    │
//! │              │   │  go inline   │   │  such transaction has finished   │
//! └──────────────┘   └──────────────┘   └──────────────────────────────────┘
//!   catching_up          inline               inline
//! ```
//!
//! The drain reads through a persistent subscription named
//! `projection:<name>`, one page per transaction, so a crash resumes where the
//! last committed page left off.
//!
//! The flip records the highest transaction id assigned so far as the
//! projection's boundary. From then on appends with a higher id project the
//! projection inline. Transactions at or below the boundary that were still
//! open at the flip never will, and the drain could not see them either.
//! Reconciliation picks them up: it keeps reading the catch-up cursor,
//! projecting only events at or below the boundary, until the oldest
//! in-flight transaction id is above the boundary. At that point every such
//! transaction has committed or rolled back, and the last page saw them all.
//!
//! ## Rust Pattern: Explicit State Machine
//!
//! [`CatchUp::step`] performs one unit of work and returns what to do next.
//! [`CatchUp::run`] drives it to completion on the calling thread; the
//! [`worker`](crate::worker) module drives it on a background thread with
//! progress reporting and cancellation between steps.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::CatchUpConfig;
use crate::projection::ProjectionRegistry;
use crate::storage::Session;
use crate::subscription::PersistentSubscriptions;
use crate::types::{ProjectionPhase, SubscriptionQuery};
use crate::{Error, Result};

/// Name of the subscription cursor that catch-up uses for `projection`.
pub fn catchup_subscription_name(projection: &str) -> String {
    format!("projection:{}", projection)
}

// =============================================================================
// State
// =============================================================================

/// Where a [`CatchUp`] currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpPhase {
    /// Nothing done yet; the projection record has not been inspected.
    Starting,
    /// Reading the backlog page by page.
    Draining,
    /// Backlog drained; next step switches the projection to inline.
    Flipping,
    /// Projection is inline; absorbing transactions at or below `boundary`.
    Reconciling { boundary: i64, attempts: u32 },
    /// Done; the catch-up cursor is deleted.
    Finished,
}

/// What the driver should do after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpStep {
    /// Call `step` again right away.
    Continue,
    /// Call `step` again after waiting this long.
    Wait(Duration),
    /// Catch-up is complete.
    Finished(CatchUpReport),
}

/// Progress counters, also the final result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpReport {
    pub projection: String,
    /// Events projected while draining the backlog.
    pub drained: u64,
    /// Events projected during reconciliation.
    pub reconciled: u64,
    /// The boundary recorded at the flip, once known.
    pub boundary: Option<i64>,
    /// Reconciliation attempts that had to wait for open transactions.
    pub reconcile_attempts: u32,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Catch-up of one projection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ledgerdb::{CatchUp, CatchUpConfig, Database, EventStore, PersistentSubscriptions,
///                ProjectionRegistry, Projectors, RegistryConfig};
///
/// # let projectors = Projectors::new();
/// let db = Database::open("events.db")?;
/// let registry = Arc::new(ProjectionRegistry::new(projectors, RegistryConfig::default()));
/// let subscriptions = PersistentSubscriptions::new(EventStore::new());
///
/// let session = db.session()?;
/// let report = CatchUp::new(registry, subscriptions, "balances", CatchUpConfig::default())?
///     .run(&session)?;
/// println!("projected {} events", report.drained + report.reconciled);
/// # Ok::<(), ledgerdb::Error>(())
/// ```
pub struct CatchUp {
    registry: Arc<ProjectionRegistry>,
    subscriptions: PersistentSubscriptions,
    name: String,
    cursor: String,
    config: CatchUpConfig,
    phase: CatchUpPhase,
    report: CatchUpReport,
}

impl std::fmt::Debug for CatchUp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatchUp")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("report", &self.report)
            .finish()
    }
}

impl CatchUp {
    pub fn new(
        registry: Arc<ProjectionRegistry>,
        subscriptions: PersistentSubscriptions,
        name: impl Into<String>,
        config: CatchUpConfig,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        Ok(Self {
            registry,
            subscriptions,
            cursor: catchup_subscription_name(&name),
            report: CatchUpReport {
                projection: name.clone(),
                drained: 0,
                reconciled: 0,
                boundary: None,
                reconcile_attempts: 0,
            },
            name,
            config,
            phase: CatchUpPhase::Starting,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> CatchUpPhase {
        self.phase
    }

    pub fn report(&self) -> &CatchUpReport {
        &self.report
    }

    /// Runs to completion on this thread, sleeping between reconciliation
    /// attempts.
    pub fn run(mut self, session: &Session) -> Result<CatchUpReport> {
        loop {
            match self.step(session)? {
                CatchUpStep::Continue => {}
                CatchUpStep::Wait(delay) => thread::sleep(delay),
                CatchUpStep::Finished(report) => return Ok(report),
            }
        }
    }

    /// Performs one unit of work.
    ///
    /// Each step commits its own transaction, so the session must not have a
    /// transaction open.
    ///
    /// # Errors
    ///
    /// - `Error::ProjectionNotFound` if the projection isn't registered
    /// - `Error::UnknownProjector` if this process doesn't host it
    /// - `Error::InvalidProjectionState` if it is already inline with no
    ///   catch-up in progress
    /// - `Error::ReconciliationIncomplete` when the attempt budget runs out;
    ///   the projection stays inline and a later catch-up resumes
    ///   reconciliation
    pub fn step(&mut self, session: &Session) -> Result<CatchUpStep> {
        if session.in_transaction() {
            return Err(Error::Transaction(
                "catch-up must run outside a transaction".to_string(),
            ));
        }

        match self.phase {
            CatchUpPhase::Starting => self.start(session),
            CatchUpPhase::Draining => self.drain(session),
            CatchUpPhase::Flipping => self.flip(session),
            CatchUpPhase::Reconciling { boundary, attempts } => {
                self.reconcile(session, boundary, attempts)
            }
            CatchUpPhase::Finished => Ok(CatchUpStep::Finished(self.report.clone())),
        }
    }

    // =========================================================================
    // Phase 0: validate and prepare the cursor
    // =========================================================================

    fn start(&mut self, session: &Session) -> Result<CatchUpStep> {
        self.registry.projector(&self.name)?;

        let next = session.transaction(|s| {
            let record = self.registry.lock_projection(s, &self.name)?;
            match record.state {
                ProjectionPhase::Catchup => {
                    // A fresh start: discard any leftover cursor.
                    self.subscriptions.delete(s, &self.cursor)?;
                    let query = SubscriptionQuery::all().with_limit(self.config.batch_size);
                    self.subscriptions.create(s, &self.cursor, &query)?;
                    self.registry
                        .set_phase(s, &self.name, ProjectionPhase::CatchingUp, None)?;
                    Ok(CatchUpPhase::Draining)
                }
                ProjectionPhase::CatchingUp => {
                    if !self.subscriptions.exists(s, &self.cursor)? {
                        let query = SubscriptionQuery::all().with_limit(self.config.batch_size);
                        self.subscriptions.create(s, &self.cursor, &query)?;
                    }
                    Ok(CatchUpPhase::Draining)
                }
                ProjectionPhase::Inline => match record.after_transaction_id {
                    Some(boundary) if self.subscriptions.exists(s, &self.cursor)? => {
                        Ok(CatchUpPhase::Reconciling { boundary, attempts: 0 })
                    }
                    _ => Err(Error::InvalidProjectionState {
                        name: self.name.clone(),
                        state: record.state,
                    }),
                },
            }
        })?;

        info!(projection = %self.name, phase = ?next, "catch-up started");
        if let CatchUpPhase::Reconciling { boundary, .. } = next {
            self.report.boundary = Some(boundary);
        }
        self.phase = next;
        Ok(CatchUpStep::Continue)
    }

    // =========================================================================
    // Phase 1: drain the backlog
    // =========================================================================

    fn drain(&mut self, session: &Session) -> Result<CatchUpStep> {
        let projector = self.registry.projector(&self.name)?;

        let projected = session.transaction(|s| {
            let page = self.subscriptions.read(s, &self.cursor)?;
            projector.project_all(s.conn(), &page.events)?;
            self.subscriptions.ack(s, &page)?;
            Ok(page.len())
        })?;

        self.report.drained += projected as u64;
        if projected == 0 {
            debug!(projection = %self.name, drained = self.report.drained, "backlog drained");
            self.phase = CatchUpPhase::Flipping;
        }
        Ok(CatchUpStep::Continue)
    }

    // =========================================================================
    // Phase 2: switch to inline
    // =========================================================================

    fn flip(&mut self, session: &Session) -> Result<CatchUpStep> {
        let boundary = session.transaction(|s| {
            let record = self.registry.lock_projection(s, &self.name)?;
            if record.state == ProjectionPhase::Inline {
                return Err(Error::InvalidProjectionState {
                    name: self.name.clone(),
                    state: record.state,
                });
            }

            // Taken under the write lock: any transaction that gets an id
            // after this point can only append once the flip has committed,
            // and will see the projection inline.
            let boundary = s.max_assigned_transaction_id();
            self.registry
                .set_phase(s, &self.name, ProjectionPhase::Inline, Some(boundary))?;
            Ok(boundary)
        })?;

        info!(projection = %self.name, boundary, "projection is inline");
        self.report.boundary = Some(boundary);
        self.phase = CatchUpPhase::Reconciling { boundary, attempts: 0 };
        Ok(CatchUpStep::Continue)
    }

    // =========================================================================
    // Phase 3: reconcile transactions that raced the flip
    // =========================================================================

    fn reconcile(&mut self, session: &Session, boundary: i64, attempts: u32) -> Result<CatchUpStep> {
        let projector = self.registry.projector(&self.name)?;

        // Outside any transaction, so it reflects everything finished so far.
        let xmin = session.snapshot_xmin();

        let (projected, more_waiting) = session.transaction(|s| {
            let mut page = self.subscriptions.read(s, &self.cursor)?;
            let full = page.is_full();

            // Pages are ordered by transaction id, so the events to keep form
            // a prefix.
            let keep = page
                .events
                .iter()
                .position(|e| e.position.transaction_id > boundary)
                .unwrap_or(page.events.len());
            let truncated = keep < page.events.len();
            page.events.truncate(keep);
            page.end_position = page
                .events
                .last()
                .map_or(page.start_position, |e| e.position);

            projector.project_all(s.conn(), &page.events)?;
            self.subscriptions.ack(s, &page)?;
            Ok((page.len(), full && !truncated))
        })?;

        self.report.reconciled += projected as u64;

        if more_waiting {
            return Ok(CatchUpStep::Continue);
        }

        if xmin > boundary {
            self.subscriptions.delete(session, &self.cursor)?;
            self.phase = CatchUpPhase::Finished;
            info!(
                projection = %self.name,
                drained = self.report.drained,
                reconciled = self.report.reconciled,
                "catch-up complete"
            );
            return Ok(CatchUpStep::Finished(self.report.clone()));
        }

        let attempts = attempts + 1;
        self.report.reconcile_attempts = attempts;
        self.phase = CatchUpPhase::Reconciling { boundary, attempts };

        if attempts >= self.config.max_reconcile_loops {
            warn!(
                projection = %self.name,
                boundary,
                xmin,
                attempts,
                "reconciliation gave up waiting for open transactions"
            );
            return Err(Error::ReconciliationIncomplete {
                name: self.name.clone(),
                boundary,
                attempts,
            });
        }

        debug!(projection = %self.name, boundary, xmin, attempts, "waiting for open transactions");
        Ok(CatchUpStep::Wait(self.config.reconcile_interval()))
    }
}

impl ProjectionRegistry {
    /// Catches up the projection `name` on this thread.
    ///
    /// Shorthand for [`CatchUp::new`] followed by [`CatchUp::run`].
    pub fn catch_up(
        self: &Arc<Self>,
        session: &Session,
        subscriptions: &PersistentSubscriptions,
        name: &str,
        config: CatchUpConfig,
    ) -> Result<CatchUpReport> {
        CatchUp::new(Arc::clone(self), subscriptions.clone(), name, config)?.run(session)
    }
}

// =============================================================================
// Tests
// =============================================================================
