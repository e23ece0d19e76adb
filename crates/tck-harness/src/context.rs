//! One-shot execution context.
//!
//! An [`ExecutionContext`] owns a connection lease for exactly one
//! verification. Its lifecycle is
//!
//! ```text
//! Fresh ──verify──▶ Executing ──▶ Completed ─┐
//!                             └─▶ Cancelled ─┴──▶ Disposed
//! ```
//!
//! `Disposed` is terminal: the lease has been returned and any further
//! `verify` fails with [`TckError::StaleContextUse`].
//!
//! When the expectation carries a cancel timeout and the [`CancelPolicy`]
//! says so, a cancellation actor thread races the query. The race is decided
//! under one lock: whichever of "query finished" and "cancel fired" is
//! recorded first wins, and an uncancelled completion after the cancel fired
//! is a [`TckError::CancellationRaceViolation`].

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tck_error::{DriverError, DriverResult, Result, TckError};
use tracing::{debug, warn};

use crate::capture::SqlCapture;
use crate::comparator::{self, ComparisonResult, ComplianceLevel};
use crate::driver::{QueryOutput, Statement, StatementControl};
use crate::expectation::{Expectation, QuerySource};
use crate::pool::{ConnectionFactory, ConnectionLease};
use crate::tracker::{StatementTracker, TrackedHandle};

// ─── Policy ─────────────────────────────────────────────────────────────

/// Whether a context with a cancel timeout schedules its cancellation actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "seed", rename_all = "snake_case")]
pub enum CancelPolicy {
    Never,
    /// Schedule whenever a timeout is set.
    #[default]
    Always,
    /// Flip a coin seeded with the given value.
    RandomWithSeed(u64),
}

impl CancelPolicy {
    /// Decide for one verification. Deterministic for a given seed.
    pub fn should_cancel(self) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::RandomWithSeed(seed) => StdRng::seed_from_u64(seed).gen_bool(0.5),
        }
    }
}

/// Knobs fixed for the lifetime of a context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextOptions {
    pub level: ComplianceLevel,
    pub cancel_policy: CancelPolicy,
}

impl ContextOptions {
    #[must_use]
    pub fn with_level(mut self, level: ComplianceLevel) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }
}

// ─── State ──────────────────────────────────────────────────────────────

/// Lifecycle state of an [`ExecutionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Fresh,
    Executing,
    Completed,
    Cancelled,
    Disposed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fresh => "fresh",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RacePhase {
    Pending,
    Completed,
    CancelRequested,
}

/// Completion/cancellation race between the executing thread and the actor.
struct Race {
    phase: Mutex<RacePhase>,
    changed: Condvar,
}

impl Race {
    fn new() -> Self {
        Self {
            phase: Mutex::new(RacePhase::Pending),
            changed: Condvar::new(),
        }
    }

    /// Record completion; returns true when the cancel fired first.
    fn finish(&self) -> bool {
        let mut phase = self.phase.lock();
        let cancelled = *phase == RacePhase::CancelRequested;
        if *phase == RacePhase::Pending {
            *phase = RacePhase::Completed;
            self.changed.notify_all();
        }
        cancelled
    }

    /// Wait out `timeout` and cancel unless the query finished first.
    fn fire_after(&self, timeout: Duration, control: &dyn StatementControl) -> DriverResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut phase = self.phase.lock();
        while *phase == RacePhase::Pending {
            if self.changed.wait_until(&mut phase, deadline).timed_out() {
                break;
            }
        }
        if *phase != RacePhase::Pending {
            return Ok(false);
        }
        *phase = RacePhase::CancelRequested;
        drop(phase);
        control.cancel()?;
        Ok(true)
    }
}

/// Closes the statement on every exit path.
struct StatementGuard {
    control: Arc<dyn StatementControl>,
}

impl Drop for StatementGuard {
    fn drop(&mut self) {
        if let Err(err) = self.control.close() {
            debug!(error = %err, "statement close failed during cleanup");
        }
    }
}

// ─── Context ────────────────────────────────────────────────────────────

/// Runs one expectation against one leased connection.
pub struct ExecutionContext {
    lease: Option<ConnectionLease>,
    state: ContextState,
    options: ContextOptions,
    tracker: Option<Arc<StatementTracker>>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("state", &self.state)
            .field("options", &self.options)
            .field("tracked", &self.tracker.is_some())
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    pub fn new(lease: ConnectionLease, options: ContextOptions) -> Self {
        Self {
            lease: Some(lease),
            state: ContextState::Fresh,
            options,
            tracker: None,
        }
    }

    /// Lease a connection from `factory` for a new context.
    pub fn open(factory: &Arc<ConnectionFactory>, options: ContextOptions) -> Result<Self> {
        Ok(Self::new(factory.acquire()?, options))
    }

    /// Expose the running statement to `tracker` so another thread can
    /// cancel it.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<StatementTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Execute `expectation`'s query and compare the outcome.
    ///
    /// The context is disposed afterwards whatever the outcome.
    ///
    /// # Errors
    ///
    /// - [`TckError::StaleContextUse`] when called more than once.
    /// - [`TckError::DriverFault`] when a driver call fails other than by a
    ///   requested cancellation.
    /// - [`TckError::CancellationRaceViolation`] when the query completes
    ///   after its scheduled cancellation fired.
    /// - [`TckError::Configuration`] for an inconsistent expectation.
    pub fn verify(&mut self, expectation: &Expectation) -> Result<ComparisonResult> {
        if self.state != ContextState::Fresh {
            return Err(TckError::StaleContextUse {
                state: self.state.to_string(),
            });
        }
        self.transition(ContextState::Executing);
        let outcome = self.run(expectation);
        self.dispose();
        outcome
    }

    fn transition(&mut self, next: ContextState) {
        debug!(from = %self.state, to = %next, "execution context transition");
        self.state = next;
    }

    fn dispose(&mut self) {
        self.lease = None;
        self.transition(ContextState::Disposed);
    }

    fn run(&mut self, expectation: &Expectation) -> Result<ComparisonResult> {
        let query = expectation.describe_query().to_owned();
        let lease = self
            .lease
            .as_ref()
            .ok_or_else(|| TckError::harness("execution context has no connection"))?;

        if expectation.fresh_cache() {
            lease.flush_cache().map_err(|e| TckError::driver(&query, e))?;
        }
        let quote = lease.dialect().quote_identifier_string().to_owned();
        let mut statement = lease
            .create_statement()
            .map_err(|e| TckError::driver(&query, e))?;
        let guard = StatementGuard {
            control: statement.control(),
        };
        for modifier in expectation.modifiers() {
            modifier(&mut *statement).map_err(|e| TckError::driver(&query, e))?;
        }

        let tracked: Option<TrackedHandle> = self
            .tracker
            .as_ref()
            .map(|t| t.register(Arc::clone(&guard.control)));
        let cancel_after = expectation
            .cancel_timeout()
            .filter(|_| self.options.cancel_policy.should_cancel());

        let capture = SqlCapture::new();
        let race = Race::new();
        let (outcome, cancel_requested) = thread::scope(|s| {
            let actor = cancel_after.map(|timeout| {
                let race = &race;
                let control = Arc::clone(&guard.control);
                s.spawn(move || race.fire_after(timeout, &*control))
            });
            let outcome = execute(&mut *statement, expectation.query(), &capture);
            let cancel_requested = race.finish();
            if let Some(actor) = actor {
                match actor.join() {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(query = %query, error = %err, "cancel request failed"),
                    Err(_) => warn!(query = %query, "cancellation actor panicked"),
                }
            }
            (outcome, cancel_requested)
        });
        let cancelled_by_harness = tracked.as_ref().is_some_and(TrackedHandle::cancelled_by_harness);
        drop(tracked);
        drop(guard);

        let captured_sql = capture.into_statements();
        match outcome {
            Ok(_) if cancel_requested => {
                self.transition(ContextState::Cancelled);
                Err(TckError::race(
                    query,
                    "query completed after its cancellation fired",
                ))
            }
            Ok(output) => {
                self.transition(ContextState::Completed);
                let mismatches =
                    comparator::compare(expectation, &output, &captured_sql, &quote, self.options.level)?;
                Ok(ComparisonResult {
                    query,
                    mismatches,
                    captured_sql,
                    cancelled: false,
                })
            }
            Err(err) if err.is_cancellation() && (cancel_requested || cancelled_by_harness) => {
                debug!(query = %query, error = %err, "query cancelled as requested");
                self.transition(ContextState::Cancelled);
                Ok(ComparisonResult {
                    query,
                    mismatches: Vec::new(),
                    captured_sql,
                    cancelled: true,
                })
            }
            Err(err) => {
                self.transition(ContextState::Completed);
                Err(TckError::driver(query, err))
            }
        }
    }
}

fn execute(
    statement: &mut dyn Statement,
    source: &QuerySource,
    capture: &SqlCapture,
) -> std::result::Result<QueryOutput, DriverError> {
    match source {
        QuerySource::Text(sql) => statement.execute(sql, capture),
        QuerySource::Provider { produce, .. } => produce(statement, capture),
    }
}

/// Verify `expectation` on `context`.
///
/// Equivalent to [`ExecutionContext::verify`].
pub fn verify(context: &mut ExecutionContext, expectation: &Expectation) -> Result<ComparisonResult> {
    context.verify(expectation)
}
