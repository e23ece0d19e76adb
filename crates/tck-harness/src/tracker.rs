//! Registry of in-flight statements that another thread may cancel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::Rng;
use tck_error::DriverResult;
use tracing::trace;

use crate::driver::StatementControl;

/// One executing statement, as seen by a canceller.
pub struct TrackedStatement {
    pub id: u64,
    control: Arc<dyn StatementControl>,
    cancelled_by_harness: AtomicBool,
}

impl TrackedStatement {
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// Whether a harness canceller has targeted this statement.
    pub fn cancelled_by_harness(&self) -> bool {
        self.cancelled_by_harness.load(Ordering::SeqCst)
    }

    /// Cancel then close the statement unless it is already closed.
    ///
    /// Returns `Ok(false)` when the statement was closed first. The statement
    /// may still close between the check and the cancel; drivers tolerate
    /// that.
    pub fn cancel_and_close(&self) -> DriverResult<bool> {
        if self.control.is_closed() {
            return Ok(false);
        }
        self.cancelled_by_harness.store(true, Ordering::SeqCst);
        self.control.cancel()?;
        self.control.close()?;
        Ok(true)
    }
}

/// Shared set of in-flight statements.
#[derive(Default)]
pub struct StatementTracker {
    next_id: AtomicU64,
    inflight: Mutex<Vec<Arc<TrackedStatement>>>,
}

impl StatementTracker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track `control` until the returned handle drops.
    pub fn register(self: &Arc<Self>, control: Arc<dyn StatementControl>) -> TrackedHandle {
        let entry = Arc::new(TrackedStatement {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            control,
            cancelled_by_harness: AtomicBool::new(false),
        });
        self.inflight.lock().push(Arc::clone(&entry));
        trace!(id = entry.id, "statement tracked");
        TrackedHandle {
            tracker: Arc::clone(self),
            entry,
        }
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }

    /// A random in-flight statement.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Arc<TrackedStatement>> {
        let inflight = self.inflight.lock();
        if inflight.is_empty() {
            return None;
        }
        let i = rng.gen_range(0..inflight.len());
        Some(Arc::clone(&inflight[i]))
    }

    /// Every in-flight statement, for forced shutdown.
    pub fn snapshot(&self) -> Vec<Arc<TrackedStatement>> {
        self.inflight.lock().clone()
    }

    fn remove(&self, id: u64) {
        self.inflight.lock().retain(|s| s.id != id);
    }
}

/// Keeps a statement tracked; untracks on drop.
pub struct TrackedHandle {
    tracker: Arc<StatementTracker>,
    entry: Arc<TrackedStatement>,
}

impl TrackedHandle {
    pub fn cancelled_by_harness(&self) -> bool {
        self.entry.cancelled_by_harness()
    }
}

impl Drop for TrackedHandle {
    fn drop(&mut self) {
        self.tracker.remove(self.entry.id);
    }
}
