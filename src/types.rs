//! # Domain Types for LedgerDB
//!
//! The types here model the event sourcing domain: events, streams, global
//! positions, subscription queries and projection records.
//!
//! ## Invariants
//!
//! - [`GlobalPosition`] orders events across every stream. It compares
//!   `(transaction_id, sequence_number)` lexicographically, so all events of
//!   one transaction sort together and in insertion order.
//! - Stream versions start at 0 and increase by exactly one per event.
//! - A [`PersistedEvent`] always carries the resolved version of its stream.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// =============================================================================
// Events
// =============================================================================

/// An event that has not been written yet: a type tag and an opaque payload.
///
/// The payload is bytes. [`Event::json`] is a convenience for the common case
/// of JSON payloads, but the log itself never looks inside `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: String,
    pub data: Vec<u8>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
        }
    }

    /// Builds an event whose payload is the JSON encoding of `payload`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ledgerdb::Event;
    ///
    /// #[derive(serde::Serialize)]
    /// struct Deposited { amount: u64 }
    ///
    /// let event = Event::json("Deposited", &Deposited { amount: 10 })?;
    /// assert_eq!(event.data, br#"{"amount":10}"#);
    /// # Ok::<(), ledgerdb::Error>(())
    /// ```
    pub fn json<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(event_type, serde_json::to_vec(payload)?))
    }
}

// =============================================================================
// Stream Identification
// =============================================================================

/// Identifies a stream, optionally pinned to a version.
///
/// The version means different things depending on where the id is used:
///
/// | Operation | `version = None` | `version = Some(v)` |
/// |-----------|------------------|---------------------|
/// | `append` | No precondition | Stream must currently be at `v` |
/// | `load` | Whole stream | Suffix with version >= `v` |
/// | [`PersistedEvent`] | never | The event's own version |
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub id: String,
    pub version: Option<i64>,
}

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
        }
    }

    /// Returns a copy of this id pinned to `version`.
    pub fn with_version(&self, version: i64) -> Self {
        Self {
            id: self.id.clone(),
            version: Some(version),
        }
    }

    /// Returns a copy of this id with the version cleared.
    pub fn without_version(&self) -> Self {
        Self::new(self.id.clone())
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Some(v) => write!(f, "{}@{}", self.id, v),
            None => f.write_str(&self.id),
        }
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Global Position
// =============================================================================

/// Position of an event in the global log.
///
/// `transaction_id` is the id of the storage transaction that wrote the event
/// and `sequence_number` is the event row id. The derived `Ord` compares the
/// fields in declaration order, which gives exactly the total order that
/// `read` returns.
///
/// # Rust Pattern: Derived Ordering
///
/// `#[derive(PartialOrd, Ord)]` on a struct compares fields top to bottom.
/// Reordering the fields would silently change the ordering, so they stay put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalPosition {
    pub transaction_id: i64,
    pub sequence_number: i64,
}

impl GlobalPosition {
    /// Sorts before every event ever written.
    pub const START: GlobalPosition = GlobalPosition {
        transaction_id: 0,
        sequence_number: 0,
    };

    pub fn new(transaction_id: i64, sequence_number: i64) -> Self {
        Self {
            transaction_id,
            sequence_number,
        }
    }
}

impl Default for GlobalPosition {
    fn default() -> Self {
        Self::START
    }
}

impl fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_id, self.sequence_number)
    }
}

/// An event as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedEvent {
    pub position: GlobalPosition,
    pub event: Event,
    /// Always carries the event's resolved version.
    pub stream_id: StreamId,
}

impl PersistedEvent {
    /// The event's version within its stream.
    pub fn version(&self) -> i64 {
        self.stream_id.version.unwrap_or_default()
    }

    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    /// Decodes a JSON payload written with [`Event::json`].
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.event.data)?)
    }
}

// =============================================================================
// Subscription Queries
// =============================================================================

/// A filter over the global log.
///
/// Stored as JSON inside each subscription cursor row, which is why every
/// field has a serde default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionQuery {
    /// Streams to include. Empty means every stream.
    #[serde(default)]
    pub stream_ids: BTreeSet<String>,

    /// Exclusive lower bound.
    #[serde(default)]
    pub from: Option<GlobalPosition>,

    /// Return events from transactions that committed while an older
    /// transaction is still open. Such a read may later reveal events that
    /// sort before ones it already returned.
    #[serde(default)]
    pub allow_gaps: bool,

    /// Maximum number of events returned.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SubscriptionQuery {
    /// Every event of every stream, gap-free.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_streams<I, S>(stream_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stream_ids: stream_ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_from(mut self, from: GlobalPosition) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_allow_gaps(mut self, allow_gaps: bool) -> Self {
        self.allow_gaps = allow_gaps;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One batch read through a named subscription.
///
/// `end_position` is the position of the last event, or `start_position` when
/// the page is empty, so acknowledging an empty page never moves the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPage {
    pub subscription_name: String,
    pub events: Vec<PersistedEvent>,
    pub start_position: GlobalPosition,
    pub end_position: GlobalPosition,
    pub requested_batch_size: usize,
}

impl EventPage {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// True when the read stopped because it hit the batch size, so more
    /// events may be waiting.
    pub fn is_full(&self) -> bool {
        self.events.len() >= self.requested_batch_size
    }
}

// =============================================================================
// Projections
// =============================================================================

/// Lifecycle phase of a registered projection.
///
/// ```text
/// catchup ──► catching_up ──► inline
/// ```
///
/// There is no way back. Removing and re-adding a projection starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionPhase {
    /// Registered, backlog not touched yet.
    Catchup,
    /// Backlog drain in progress.
    CatchingUp,
    /// New events are projected inside the appending transaction.
    Inline,
}

impl ProjectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionPhase::Catchup => "catchup",
            ProjectionPhase::CatchingUp => "catching_up",
            ProjectionPhase::Inline => "inline",
        }
    }
}

impl fmt::Display for ProjectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectionPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "catchup" => Ok(ProjectionPhase::Catchup),
            "catching_up" => Ok(ProjectionPhase::CatchingUp),
            "inline" => Ok(ProjectionPhase::Inline),
            other => Err(Error::Schema(format!("unknown projection state '{}'", other))),
        }
    }
}

/// # Rust Pattern: ToSql / FromSql
///
/// Implementing rusqlite's conversion traits lets the phase be bound as a
/// parameter and read with `row.get()` directly.
impl ToSql for ProjectionPhase {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ProjectionPhase {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

/// A row of the projection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionRecord {
    pub name: String,
    pub state: ProjectionPhase,
    /// Highest transaction id assigned when the projection went inline.
    /// Transactions above it are projected inline; the rest are reconciled.
    pub after_transaction_id: Option<i64>,
}

/// Position token for polling without a persisted cursor.
///
/// The caller keeps it between runs, and may persist it anywhere through
/// serde.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionState {
    pub position: Option<GlobalPosition>,
}

impl ProjectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(position: GlobalPosition) -> Self {
        Self {
            position: Some(position),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
