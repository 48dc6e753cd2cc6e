//! # Configuration
//!
//! Every tunable lives in a plain struct that deserializes with `serde`, so a
//! hosting service can load it from whatever file format it already uses.
//! Missing fields fall back to the defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// =============================================================================
// Store
// =============================================================================

/// Settings for [`Database`](crate::Database) and the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long a connection waits for the SQLite write lock before failing.
    /// Default: 5000ms
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Rows fetched per query while iterating a global `read`.
    /// Default: 500
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_read_batch_size() -> usize {
    500
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            read_batch_size: default_read_batch_size(),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_busy_timeout_ms(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn with_read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size;
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_batch_size == 0 {
            return Err(Error::Config("read_batch_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Projection Registry
// =============================================================================

/// Settings for [`ProjectionRegistry`](crate::ProjectionRegistry).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Skip inline projections whose projector is not hosted by this process
    /// instead of failing the append.
    /// Default: false
    #[serde(default)]
    pub ignore_unknown_projectors: bool,
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_unknown_projectors(mut self, ignore: bool) -> Self {
        self.ignore_unknown_projectors = ignore;
        self
    }
}

// =============================================================================
// Catch-up
// =============================================================================

/// Settings for the catch-up coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchUpConfig {
    /// Events per page while draining the backlog and reconciling.
    /// Default: 1000
    #[serde(default = "default_catchup_batch_size")]
    pub batch_size: usize,

    /// Reconciliation attempts before giving up with
    /// [`Error::ReconciliationIncomplete`].
    /// Default: 100
    #[serde(default = "default_max_reconcile_loops")]
    pub max_reconcile_loops: u32,

    /// Pause between reconciliation attempts.
    /// Default: 1000ms
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

fn default_catchup_batch_size() -> usize {
    1000
}

fn default_max_reconcile_loops() -> u32 {
    100
}

fn default_reconcile_interval_ms() -> u64 {
    1000
}

impl Default for CatchUpConfig {
    fn default() -> Self {
        Self {
            batch_size: default_catchup_batch_size(),
            max_reconcile_loops: default_max_reconcile_loops(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
        }
    }
}

impl CatchUpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_reconcile_loops(mut self, loops: u32) -> Self {
        self.max_reconcile_loops = loops;
        self
    }

    pub fn with_reconcile_interval_ms(mut self, ms: u64) -> Self {
        self.reconcile_interval_ms = ms;
        self
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("catch-up batch_size must be at least 1".to_string()));
        }
        if self.max_reconcile_loops == 0 {
            return Err(Error::Config("max_reconcile_loops must be at least 1".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Settings for the background polling worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Sleep between polls when the last batch was empty.
    /// Default: 100ms
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PollingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
