//! # Background Workers
//!
//! Catch-up and polling are loops that mostly wait on SQLite. The workers in
//! this module run them on dedicated OS threads and expose them to async code
//! through Tokio channels.
//!
//! ```text
//! ┌────────────────────────────┐            ┌───────────────────────────┐
//! │  async caller              │            │  Dedicated OS Thread      │
//! │                            │  watch     │                           │
//! │  handle.progress() ◄───────┼────────────┼─ after every step         │
//! │  handle.cancel()  ─────────┼─ AtomicBool┼─► checked between steps   │
//! │  handle.wait().await ◄─────┼────────────┼─ final Result             │
//! │                            │  oneshot   │  owns its Session         │
//! └────────────────────────────┘            └───────────────────────────┘
//! ```
//!
//! ## Why Threads, Not Tasks?
//!
//! A `Session` wraps a `rusqlite::Connection`, which is `Send` but not
//! `Sync`, and every call on it blocks. Moving it onto its own thread keeps
//! blocking I/O off the async runtime.
//!
//! ## Cancellation
//!
//! Cancellation is cooperative: the worker finishes the step it is in (each
//! step is one committed transaction) and then stops. Sleeps wake up early
//! on cancel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tracing::{debug, error};

use crate::catchup::{CatchUp, CatchUpPhase, CatchUpReport, CatchUpStep};
use crate::config::PollingConfig;
use crate::polling::PollingProjection;
use crate::schema::Database;
use crate::types::ProjectionState;
use crate::{Error, Result};

// =============================================================================
// Handle
// =============================================================================

/// Handle on a background worker.
///
/// Dropping the handle does not stop the worker; call
/// [`cancel`](Self::cancel) first.
pub struct WorkerHandle<P, R> {
    cancelled: Arc<AtomicBool>,
    progress: watch::Receiver<P>,
    done: oneshot::Receiver<Result<R>>,
    thread: JoinHandle<()>,
}

impl<P: Clone, R> WorkerHandle<P, R> {
    /// Asks the worker to stop after its current step.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.thread.thread().unpark();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> P {
        self.progress.borrow().clone()
    }

    /// A receiver that is notified on every progress update.
    pub fn subscribe(&self) -> watch::Receiver<P> {
        self.progress.clone()
    }

    /// Waits for the worker to finish.
    ///
    /// # Errors
    ///
    /// The worker's own error, or `Error::Cancelled` if it was cancelled or
    /// died without reporting.
    pub async fn wait(self) -> Result<R> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

/// Sleeps for `duration` unless cancelled first. Returns false if cancelled.
fn sleep_unless_cancelled(cancelled: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::park_timeout(deadline - now);
    }
}

// =============================================================================
// Catch-up Worker
// =============================================================================

/// Progress of a background catch-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpStatus {
    pub phase: CatchUpPhase,
    pub report: CatchUpReport,
}

pub type CatchUpHandle = WorkerHandle<CatchUpStatus, CatchUpReport>;

/// Runs `catch_up` to completion on a new thread with its own session.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example(db: ledgerdb::Database, catch_up: ledgerdb::CatchUp) -> ledgerdb::Result<()> {
/// let handle = ledgerdb::worker::spawn_catchup(&db, catch_up)?;
/// let report = handle.wait().await?;
/// println!("caught up with boundary {:?}", report.boundary);
/// # Ok(())
/// # }
/// ```
pub fn spawn_catchup(db: &Database, mut catch_up: CatchUp) -> Result<CatchUpHandle> {
    let session = db.session()?;
    let cancelled = Arc::new(AtomicBool::new(false));
    let (progress_tx, progress_rx) = watch::channel(CatchUpStatus {
        phase: catch_up.phase(),
        report: catch_up.report().clone(),
    });
    let (done_tx, done_rx) = oneshot::channel();

    let flag = Arc::clone(&cancelled);
    let thread = thread::Builder::new()
        .name(format!("ledgerdb-catchup-{}", catch_up.name()))
        .spawn(move || {
            let result = loop {
                if flag.load(Ordering::SeqCst) {
                    break Err(Error::Cancelled);
                }

                let step = catch_up.step(&session);
                progress_tx.send_replace(CatchUpStatus {
                    phase: catch_up.phase(),
                    report: catch_up.report().clone(),
                });

                match step {
                    Ok(CatchUpStep::Continue) => {}
                    Ok(CatchUpStep::Wait(delay)) => {
                        if !sleep_unless_cancelled(&flag, delay) {
                            break Err(Error::Cancelled);
                        }
                    }
                    Ok(CatchUpStep::Finished(report)) => break Ok(report),
                    Err(e) => break Err(e),
                }
            };

            if let Err(e) = &result {
                error!(projection = %catch_up.name(), error = %e, "catch-up worker stopped");
            }
            let _ = done_tx.send(result);
        })
        .map_err(|e| Error::Schema(format!("failed to spawn catch-up thread: {}", e)))?;

    Ok(WorkerHandle {
        cancelled,
        progress: progress_rx,
        done: done_rx,
        thread,
    })
}

// =============================================================================
// Polling Worker
// =============================================================================

/// Progress of a background poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollingStatus {
    /// Events projected since the worker started.
    pub projected: u64,
    /// Completed runs, including empty ones.
    pub runs: u64,
    pub state: ProjectionState,
}

pub type PollingHandle = WorkerHandle<PollingStatus, PollingStatus>;

/// Runs `polling` repeatedly on a new thread until cancelled.
///
/// Batches are read back to back while there is work; after an empty batch
/// the worker sleeps for `config.poll_interval_ms`. On cancel it finishes
/// with the final status. A projector error stops it with that error.
pub fn spawn_polling(
    db: &Database,
    polling: PollingProjection,
    initial: ProjectionState,
    config: PollingConfig,
) -> Result<PollingHandle> {
    let session = db.session()?;
    let cancelled = Arc::new(AtomicBool::new(false));
    let (progress_tx, progress_rx) = watch::channel(PollingStatus {
        state: initial,
        ..PollingStatus::default()
    });
    let (done_tx, done_rx) = oneshot::channel();

    let flag = Arc::clone(&cancelled);
    let thread = thread::Builder::new()
        .name("ledgerdb-poller".to_string())
        .spawn(move || {
            let mut status = PollingStatus {
                state: initial,
                ..PollingStatus::default()
            };

            let result = loop {
                if flag.load(Ordering::SeqCst) {
                    debug!(projected = status.projected, runs = status.runs, "poller cancelled");
                    break Ok(status);
                }

                match polling.run(&session, &status.state) {
                    Ok(outcome) => {
                        status.projected += outcome.projected as u64;
                        status.runs += 1;
                        status.state = outcome.state;
                        progress_tx.send_replace(status);

                        if outcome.projected == 0 && !sleep_unless_cancelled(&flag, config.poll_interval()) {
                            break Ok(status);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "poller stopped");
                        break Err(e);
                    }
                }
            };
            let _ = done_tx.send(result);
        })
        .map_err(|e| Error::Schema(format!("failed to spawn polling thread: {}", e)))?;

    Ok(WorkerHandle {
        cancelled,
        progress: progress_rx,
        done: done_rx,
        thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_returns_early_when_cancelled() {
        let flag = AtomicBool::new(true);
        let start = Instant::now();
        assert!(!sleep_unless_cancelled(&flag, Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));

        let flag = AtomicBool::new(false);
        assert!(sleep_unless_cancelled(&flag, Duration::from_millis(1)));
    }
}
