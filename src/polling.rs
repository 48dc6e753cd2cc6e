//! # Polling Projections
//!
//! The simplest way to keep a read model current: call
//! [`PollingProjection::run`] in a loop. Each run reads one batch, projects it
//! in order and returns the position reached.
//!
//! Two ways to remember the position between runs:
//!
//! | Cursor | Progress lives in | Atomic with the read model |
//! |--------|-------------------|----------------------------|
//! | [`PollingProjection::persisted`] | `es_subscription` row | Yes, one transaction per run |
//! | [`PollingProjection::with_query`] | the [`ProjectionState`] you keep | Only if you store it yourself |

use tracing::debug;

use crate::event_log::EventStore;
use crate::projection::RegisteredProjector;
use crate::storage::Session;
use crate::subscription::{PersistentSubscriptions, DEFAULT_BATCH_SIZE};
use crate::types::{GlobalPosition, ProjectionState, SubscriptionQuery};
use crate::Result;

#[derive(Debug, Clone)]
enum Cursor {
    Persisted {
        subscriptions: PersistentSubscriptions,
        name: String,
    },
    Token {
        events: EventStore,
        query: SubscriptionQuery,
    },
}

/// Outcome of one [`PollingProjection::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Events handed to the projector.
    pub projected: usize,
    /// Token to pass to the next run.
    pub state: ProjectionState,
}

/// Drives one projector over the log, one batch per call.
#[derive(Debug, Clone)]
pub struct PollingProjection {
    projector: RegisteredProjector,
    cursor: Cursor,
}

impl PollingProjection {
    /// Polls through the persistent subscription `name`, which must exist.
    ///
    /// Read, projection and acknowledgement commit together, so the
    /// `ProjectionState` passed to [`run`](Self::run) is ignored.
    pub fn persisted(
        projector: RegisteredProjector,
        subscriptions: PersistentSubscriptions,
        name: impl Into<String>,
    ) -> Self {
        Self {
            projector,
            cursor: Cursor::Persisted {
                subscriptions,
                name: name.into(),
            },
        }
    }

    /// Polls `query`, resuming after the position in the caller's token.
    ///
    /// A query without a limit reads batches of
    /// [`DEFAULT_BATCH_SIZE`](crate::subscription::DEFAULT_BATCH_SIZE). An
    /// empty token starts at `query.from`.
    pub fn with_query(projector: RegisteredProjector, events: EventStore, query: SubscriptionQuery) -> Self {
        Self {
            projector,
            cursor: Cursor::Token { events, query },
        }
    }

    /// Reads one batch and projects it.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use ledgerdb::{Database, EventStore, PersistedEvent, PollingProjection, ProjectionState,
    /// #                RegisteredProjector, SubscriptionQuery};
    /// # let db = Database::open("events.db")?;
    /// # let session = db.session()?;
    /// let printer = |_: &rusqlite::Connection, e: &PersistedEvent| -> ledgerdb::Result<()> {
    ///     println!("{}", e.event_type());
    ///     Ok(())
    /// };
    /// let polling = PollingProjection::with_query(
    ///     RegisteredProjector::basic(printer),
    ///     EventStore::new(),
    ///     SubscriptionQuery::all(),
    /// );
    ///
    /// let mut state = ProjectionState::new();
    /// loop {
    ///     let outcome = polling.run(&session, &state)?;
    ///     state = outcome.state;
    ///     if outcome.projected == 0 {
    ///         break;
    ///     }
    /// }
    /// # Ok::<(), ledgerdb::Error>(())
    /// ```
    pub fn run(&self, session: &Session, state: &ProjectionState) -> Result<PollOutcome> {
        let outcome = match &self.cursor {
            Cursor::Persisted { subscriptions, name } => session.transaction(|s| {
                let page = subscriptions.read(s, name)?;
                self.projector.project_all(s.conn(), &page.events)?;
                subscriptions.ack(s, &page)?;
                Ok(PollOutcome {
                    projected: page.len(),
                    state: ProjectionState::at(page.end_position),
                })
            })?,
            Cursor::Token { events, query } => {
                let mut batch = query.clone();
                if let Some(position) = state.position {
                    batch.from = Some(position);
                }
                batch.limit = Some(query.limit.unwrap_or(DEFAULT_BATCH_SIZE));

                let read = events.read(session, &batch)?.collect::<Result<Vec<_>>>()?;
                self.projector.project_all(session.conn(), &read)?;

                let reached = read
                    .last()
                    .map(|e| e.position)
                    .or(state.position)
                    .or(query.from);
                PollOutcome {
                    projected: read.len(),
                    state: ProjectionState { position: reached },
                }
            }
        };

        if outcome.projected > 0 {
            debug!(
                projected = outcome.projected,
                position = %outcome.state.position.unwrap_or(GlobalPosition::START),
                "polling batch projected"
            );
        }
        Ok(outcome)
    }
}

// =============================================================================
// Tests
// =============================================================================
