//! # LedgerDB - Event Log with Catch-up Projections
//!
//! LedgerDB is an event store built on SQLite. It provides:
//!
//! - **Optimistic-concurrency appends**: per-stream versions, conflict on mismatch
//! - **Gap-free global reads**: a total order that never reorders behind a reader
//! - **Persistent subscriptions**: named cursors with read/ack cycles
//! - **Projections**: inline (in the appending transaction) after a
//!   crash-resumable catch-up over the existing history
//! - **Polling**: one-batch-at-a-time projection runs with persisted or
//!   caller-held positions
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Workers (dedicated threads, async handles)          │
//! │                   spawn_catchup · spawn_polling                  │
//! └──────────────┬───────────────────────────────┬──────────────────┘
//!                ▼                               ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │      Catch-up Coordinator    │  │     Polling Projection       │
//! │  drain ─► flip ─► reconcile  │  │   read ─► project ─► ack     │
//! └──────────────┬───────────────┘  └──────────────┬───────────────┘
//!                ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Persistent Subscriptions        Projection Registry           │
//! │   (es_subscription cursors)       (es_projection, run_inline)   │
//! └──────────────┬──────────────────────────────────▲───────────────┘
//!                ▼                                  │ inline
//! ┌─────────────────────────────────────────────────┴───────────────┐
//! │                         Event Store                             │
//! │                 append · load · read (gap control)              │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            Session (SQLite connection + transaction ids)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Stream order**: versions start at 0 and increase by one per event
//! 2. **Global order**: `read` is strictly increasing by `(transaction_id, sequence_number)`
//! 3. **No reordering**: a gap-free read never returns an event while an older
//!    transaction could still commit events that sort before it
//! 4. **Atomic appends**: events, stream version and inline projections commit together
//! 5. **Exactly one path per event**: after catch-up, each transaction is
//!    projected either inline or by reconciliation, never both
//!
//! ## Module Organization
//!
//! - [`error`]: Error type for all failure modes
//! - [`config`]: Serde-loadable settings with defaults
//! - [`schema`]: SQLite DDL and the [`Database`] handle
//! - [`storage`]: [`Session`], transactions and transaction ids
//! - [`types`]: Domain types (Event, StreamId, GlobalPosition, etc.)
//! - [`event_log`]: Append, load and global read
//! - [`subscription`]: Persistent subscription cursors
//! - [`projection`]: Projector traits and the projection registry
//! - [`catchup`]: The catch-up state machine
//! - [`polling`]: Polling projection runner
//! - [`worker`]: Background threads for catch-up and polling

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for LedgerDB operations.
pub mod error;

/// Configuration structs, loadable with serde.
pub mod config;

/// SQLite schema definitions and the database handle.
pub mod schema;

/// Sessions, transactions and transaction id tracking.
pub mod storage;

/// Domain types for event sourcing.
pub mod types;

/// The event log: append, load and the gap-controlled global read.
pub mod event_log;

/// Named subscription cursors with read/ack semantics.
pub mod subscription;

/// Projector traits, the projector map and the projection registry.
pub mod projection;

/// Catch-up of a projection from its backlog to inline mode.
pub mod catchup;

/// Polling projection runner.
pub mod polling;

/// Background catch-up and polling threads.
///
/// Each worker owns its own [`Session`] and reports progress through a
/// `tokio::sync::watch` channel.
pub mod worker;

// =============================================================================
// Re-exports
// =============================================================================

pub use catchup::{catchup_subscription_name, CatchUp, CatchUpPhase, CatchUpReport, CatchUpStep};
pub use config::{CatchUpConfig, PollingConfig, RegistryConfig, StoreConfig};
pub use error::{Error, Result};
pub use event_log::{EventIter, EventStore};
pub use polling::{PollOutcome, PollingProjection};
pub use projection::{
    ProjectionRegistry, Projector, ProjectorLifecycle, Projectors, RegisteredProjector,
};
pub use schema::Database;
pub use storage::Session;
pub use subscription::{PersistentSubscriptions, SubscriptionCursor, DEFAULT_BATCH_SIZE};
pub use worker::{spawn_catchup, spawn_polling, CatchUpHandle, CatchUpStatus, PollingHandle, PollingStatus};

pub use types::{
    Event, EventPage, GlobalPosition, PersistedEvent, ProjectionPhase, ProjectionRecord,
    ProjectionState, StreamId, SubscriptionQuery,
};
