//! Concurrent cancellation harness.
//!
//! `workers` threads each loop over the query list, running every query
//! through a one-shot [`ExecutionContext`] on a connection leased from a
//! shared [`ConnectionFactory`]. A canceller thread meanwhile picks random
//! in-flight statements and cancels and closes them. Failures are collected
//! rather than raised; the returned [`HarnessRun`] lists all of them.
//!
//! Shutdown is ordered: when the run deadline passes the stop flag is raised,
//! workers get one grace period to finish their current query, in-flight
//! statements are then force-cancelled, workers get a second grace period,
//! and whoever is still running is reported as a straggler and left behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tck_error::{Result, TckError};
use tracing::{debug, error, info, warn};

use crate::comparator::{ComparisonResult, ComplianceLevel};
use crate::context::{CancelPolicy, ContextOptions, ExecutionContext};
use crate::derive_worker_seed;
use crate::expectation::Expectation;
use crate::pool::ConnectionFactory;
use crate::tracker::StatementTracker;

// ─── Configuration ──────────────────────────────────────────────────────

/// When a worker stops picking queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLimit {
    /// Keep going until this much time has passed since the start.
    Duration(Duration),
    /// Run this many queries per worker.
    Runs(usize),
}

/// How a worker picks its next query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOrder {
    #[default]
    Random,
    RoundRobin,
}

/// Parameters of one harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub workers: usize,
    pub limit: RunLimit,
    pub order: QueryOrder,
    /// Number of harness-initiated cancellations; zero disables the
    /// canceller.
    pub cancellations: usize,
    /// Upper bound of the random pause between two cancellation attempts.
    pub cancel_interval: Duration,
    pub seed: u64,
    /// Overall cap on the run, after which orderly shutdown starts.
    pub deadline: Duration,
    /// Wait applied twice during shutdown: before and after force-cancel.
    pub shutdown_grace: Duration,
    /// Policy for per-expectation cancel timeouts.
    pub cancel_policy: CancelPolicy,
    pub level: ComplianceLevel,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            limit: RunLimit::Runs(10),
            order: QueryOrder::Random,
            cancellations: 20,
            cancel_interval: Duration::from_millis(10),
            seed: crate::TCK_SEED,
            deadline: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            cancel_policy: CancelPolicy::Never,
            level: ComplianceLevel::default(),
        }
    }
}

impl HarnessConfig {
    fn validate(&self, queries: usize) -> Result<()> {
        if self.workers == 0 {
            return Err(TckError::configuration("harness needs at least one worker"));
        }
        if u16::try_from(self.workers).is_err() {
            return Err(TckError::configuration(format!(
                "too many harness workers: {}",
                self.workers
            )));
        }
        if queries == 0 {
            return Err(TckError::configuration("harness needs at least one query"));
        }
        if self.limit == RunLimit::Runs(0) || self.limit == RunLimit::Duration(Duration::ZERO) {
            return Err(TckError::configuration("harness run limit must be positive"));
        }
        Ok(())
    }
}

// ─── Report ─────────────────────────────────────────────────────────────

/// One collected failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessFailure {
    /// Worker that hit the failure; `None` for the canceller and shutdown.
    pub worker: Option<usize>,
    pub category: String,
    pub message: String,
}

impl HarnessFailure {
    fn from_error(worker: Option<usize>, err: &TckError) -> Self {
        Self {
            worker,
            category: format!("{:?}", err.category()),
            message: err.to_string(),
        }
    }
}

/// Outcome of [`run_concurrent_harness`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessRun {
    pub seed: u64,
    pub workers: usize,
    /// Verifications that completed and matched.
    pub succeeded: u64,
    /// Verifications ended by a cancellation.
    pub cancelled: u64,
    /// Statements the canceller cancelled and closed.
    pub cancel_attempts: u64,
    /// Picks skipped because the statement had already closed.
    pub cancel_skipped: u64,
    /// Workers still running after the second shutdown grace.
    pub stragglers: Vec<usize>,
    pub wall_time_ms: u64,
    pub errors: Vec<HarnessFailure>,
}

impl HarnessRun {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Pretty-printed JSON report.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TckError::harness(format!("cannot serialize run report: {e}")))
    }
}

// ─── Shared state ───────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    succeeded: AtomicU64,
    cancelled: AtomicU64,
    cancel_attempts: AtomicU64,
    cancel_skipped: AtomicU64,
}

struct Shared {
    factory: Arc<ConnectionFactory>,
    queries: Arc<[Expectation]>,
    config: HarnessConfig,
    started: Instant,
    stop: AtomicBool,
    active_workers: AtomicUsize,
    tracker: Arc<StatementTracker>,
    counters: Counters,
    errors: Mutex<Vec<HarnessFailure>>,
}

impl Shared {
    fn collect(&self, worker: Option<usize>, err: &TckError) {
        error!(worker, category = ?err.category(), error = %err, "harness failure");
        self.errors.lock().push(HarnessFailure::from_error(worker, err));
    }

    fn should_stop(&self, runs: usize) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return true;
        }
        match self.config.limit {
            RunLimit::Duration(limit) => self.started.elapsed() >= limit,
            RunLimit::Runs(max) => runs >= max,
        }
    }
}

/// Reports a worker as finished even when it panics.
struct DoneSignal {
    worker: usize,
    shared: Arc<Shared>,
    tx: Sender<usize>,
}

impl Drop for DoneSignal {
    fn drop(&mut self) {
        self.shared.active_workers.fetch_sub(1, Ordering::SeqCst);
        let _ = self.tx.send(self.worker);
    }
}

// ─── Run ────────────────────────────────────────────────────────────────

/// Run `queries` from `config.workers` threads while a canceller cancels
/// in-flight statements at random.
///
/// Per-query failures are collected into [`HarnessRun::errors`]; only setup
/// problems are returned as `Err`.
pub fn run_concurrent_harness(
    factory: Arc<ConnectionFactory>,
    queries: Arc<[Expectation]>,
    config: &HarnessConfig,
) -> Result<HarnessRun> {
    config.validate(queries.len())?;
    let shared = Arc::new(Shared {
        factory,
        queries,
        config: config.clone(),
        started: Instant::now(),
        stop: AtomicBool::new(false),
        active_workers: AtomicUsize::new(config.workers),
        tracker: StatementTracker::new(),
        counters: Counters::default(),
        errors: Mutex::new(Vec::new()),
    });
    info!(
        workers = config.workers,
        queries = shared.queries.len(),
        source = %shared.factory.source(),
        seed = config.seed,
        cancellations = config.cancellations,
        "harness starting"
    );

    let (done_tx, done_rx) = mpsc::channel();
    let mut handles: Vec<Option<JoinHandle<()>>> = Vec::with_capacity(config.workers);
    for worker in 0..config.workers {
        let signal = DoneSignal {
            worker,
            shared: Arc::clone(&shared),
            tx: done_tx.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("tck-worker-{worker}"))
            .spawn(move || run_worker(&signal));
        match spawned {
            Ok(handle) => handles.push(Some(handle)),
            Err(err) => {
                // The failed closure's signal already accounted for `worker`.
                let missing = config.workers - worker - 1;
                shared.active_workers.fetch_sub(missing, Ordering::SeqCst);
                shared.stop.store(true, Ordering::SeqCst);
                return Err(err.into());
            }
        }
    }
    drop(done_tx);

    let canceller = if config.cancellations > 0 {
        let canceller_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("tck-canceller".to_owned())
            .spawn(move || run_canceller(&canceller_shared));
        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                shared.stop.store(true, Ordering::SeqCst);
                return Err(err.into());
            }
        }
    } else {
        None
    };

    let stragglers = await_workers(&shared, &done_rx, &mut handles);
    shared.stop.store(true, Ordering::SeqCst);
    if let Some(canceller) = canceller {
        if canceller.join().is_err() {
            shared.collect(None, &TckError::harness("canceller thread panicked"));
        }
    }

    let errors = std::mem::take(&mut *shared.errors.lock());
    let c = &shared.counters;
    let run = HarnessRun {
        seed: config.seed,
        workers: config.workers,
        succeeded: c.succeeded.load(Ordering::SeqCst),
        cancelled: c.cancelled.load(Ordering::SeqCst),
        cancel_attempts: c.cancel_attempts.load(Ordering::SeqCst),
        cancel_skipped: c.cancel_skipped.load(Ordering::SeqCst),
        stragglers,
        wall_time_ms: duration_ms(shared.started.elapsed()),
        errors,
    };
    info!(
        succeeded = run.succeeded,
        cancelled = run.cancelled,
        cancel_attempts = run.cancel_attempts,
        errors = run.errors.len(),
        stragglers = run.stragglers.len(),
        wall_time_ms = run.wall_time_ms,
        "harness finished"
    );
    Ok(run)
}

/// Wait for workers, escalating through the shutdown sequence once the
/// deadline passes. Returns the stragglers.
fn await_workers(
    shared: &Shared,
    done_rx: &Receiver<usize>,
    handles: &mut [Option<JoinHandle<()>>],
) -> Vec<usize> {
    let config = &shared.config;
    let deadline = match config.limit {
        RunLimit::Duration(limit) => shared.started + limit.min(config.deadline),
        RunLimit::Runs(_) => shared.started + config.deadline,
    };

    let mut remaining = handles.len();
    remaining -= drain_until(shared, done_rx, handles, deadline);
    if remaining > 0 {
        debug!(remaining, "run deadline reached, stopping workers");
        shared.stop.store(true, Ordering::SeqCst);
        let grace = Instant::now() + config.shutdown_grace;
        remaining -= drain_until(shared, done_rx, handles, grace);
    }
    if remaining > 0 {
        let inflight = shared.tracker.snapshot();
        warn!(remaining, inflight = inflight.len(), "force-cancelling in-flight statements");
        for statement in inflight {
            if let Err(err) = statement.cancel_and_close() {
                shared.collect(None, &TckError::driver("<forced shutdown cancel>", err));
            }
        }
        let grace = Instant::now() + config.shutdown_grace;
        drain_until(shared, done_rx, handles, grace);
    }

    let stragglers: Vec<usize> = handles
        .iter()
        .enumerate()
        .filter_map(|(worker, handle)| handle.as_ref().map(|_| worker))
        .collect();
    for &worker in &stragglers {
        shared.collect(
            Some(worker),
            &TckError::harness(format!("worker {worker} did not stop within the shutdown grace")),
        );
    }
    stragglers
}

/// Join workers as they report done, until all have or `until` passes.
fn drain_until(
    shared: &Shared,
    done_rx: &Receiver<usize>,
    handles: &mut [Option<JoinHandle<()>>],
    until: Instant,
) -> usize {
    let mut joined = 0;
    while handles.iter().any(Option::is_some) {
        let wait = until.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(wait) {
            Ok(worker) => {
                if let Some(handle) = handles.get_mut(worker).and_then(Option::take) {
                    if handle.join().is_err() {
                        shared.collect(Some(worker), &TckError::harness("worker thread panicked"));
                    }
                    joined += 1;
                }
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
        }
    }
    joined
}

fn run_worker(signal: &DoneSignal) {
    let shared = &signal.shared;
    let worker = signal.worker;
    let worker_seed = derive_worker_seed(shared.config.seed, worker_id(worker));
    let mut rng = StdRng::seed_from_u64(worker_seed);
    let queries = &shared.queries;
    let mut runs = 0_usize;

    while !shared.should_stop(runs) {
        let index = match shared.config.order {
            QueryOrder::Random => rng.gen_range(0..queries.len()),
            QueryOrder::RoundRobin => (worker + runs) % queries.len(),
        };
        let expectation = &queries[index];
        let policy = match shared.config.cancel_policy {
            CancelPolicy::RandomWithSeed(_) => CancelPolicy::RandomWithSeed(rng.gen_range(0..u64::MAX)),
            fixed => fixed,
        };
        let options = ContextOptions::default()
            .with_level(shared.config.level)
            .with_cancel_policy(policy);
        runs += 1;

        let outcome = ExecutionContext::open(&shared.factory, options).and_then(|ctx| {
            let mut ctx = ctx.with_tracker(Arc::clone(&shared.tracker));
            ctx.verify(expectation).and_then(ComparisonResult::assert_passed)
        });
        match outcome {
            Ok(result) if result.cancelled => {
                shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                shared.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                shared.collect(Some(worker), &err);
                if err.is_fatal() {
                    break;
                }
            }
        }
    }
    debug!(worker, runs, "worker finished");
}

fn run_canceller(shared: &Shared) {
    let config = &shared.config;
    let mut rng = StdRng::seed_from_u64(derive_worker_seed(config.seed, u16::MAX));
    let interval_ms = duration_ms(config.cancel_interval);
    let mut attempts = 0_usize;

    while attempts < config.cancellations
        && !shared.stop.load(Ordering::SeqCst)
        && shared.active_workers.load(Ordering::SeqCst) > 0
    {
        thread::sleep(Duration::from_millis(rng.gen_range(0..=interval_ms)));
        let Some(statement) = shared.tracker.pick(&mut rng) else {
            continue;
        };
        attempts += 1;
        match statement.cancel_and_close() {
            Ok(true) => {
                debug!(statement = statement.id, attempts, "statement cancelled by harness");
                shared.counters.cancel_attempts.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                debug!(statement = statement.id, "statement already closed");
                shared.counters.cancel_skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) if err.is_cancellation() => {
                warn!(statement = statement.id, error = %err, "statement closed while cancelling");
                shared.counters.cancel_skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => shared.collect(None, &TckError::driver("<harness cancel>", err)),
        }
    }
    debug!(attempts, "canceller finished");
}

fn worker_id(worker: usize) -> u16 {
    u16::try_from(worker).unwrap_or(u16::MAX)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
