//! Scripted in-process driver.
//!
//! [`ScriptedDriver`] answers each query text with a canned
//! [`ScriptedResponse`]: tabular rows or a cell set, the backing SQL the
//! "engine" would have issued, a latency spent in cancellable slices, and an
//! optional failure. It is the multidimensional driver for OLAP-path tests
//! and the deterministic peer for cancellation races.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tck_error::{DriverError, DriverResult};
use tck_types::{CellSet, RowSet};
use tracing::{debug, trace};

use crate::capture::SqlCapture;
use crate::dialect::{AnsiDialect, Dialect};
use crate::driver::{Connection, Credentials, Driver, QueryOutput, Statement, StatementControl};
use crate::property::{EngineProperties, RESULT_LIMIT};

/// Sleep granularity while simulating latency.
const SLICE: Duration = Duration::from_millis(5);

// ─── Script ─────────────────────────────────────────────────────────────

/// Canned answer for one query.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    output: QueryOutput,
    backing_sql: Vec<String>,
    latency: Duration,
    error: Option<DriverError>,
    ignore_cancel: bool,
}

impl ScriptedResponse {
    pub fn rows(rows: RowSet) -> Self {
        Self::new(QueryOutput::Rows(rows))
    }

    pub fn cell_set(cell_set: CellSet) -> Self {
        Self::new(QueryOutput::CellSet(cell_set))
    }

    fn new(output: QueryOutput) -> Self {
        Self {
            output,
            backing_sql: Vec::new(),
            latency: Duration::ZERO,
            error: None,
            ignore_cancel: false,
        }
    }

    /// SQL recorded in the capture when the query starts.
    #[must_use]
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.backing_sql.push(sql.into());
        self
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail with `error` after the latency elapses.
    #[must_use]
    pub fn failing(mut self, error: DriverError) -> Self {
        self.error = Some(error);
        self
    }

    /// Keep running through cancel and close requests.
    #[must_use]
    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }
}

/// Point-in-time driver counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptStats {
    pub connects: u64,
    pub open_connections: usize,
    pub max_open_connections: usize,
    pub executions: u64,
    pub cancels: u64,
    pub cache_flushes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    open: AtomicUsize,
    max_open: AtomicUsize,
    executions: AtomicU64,
    cancels: AtomicU64,
    cache_flushes: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    script: RwLock<HashMap<String, ScriptedResponse>>,
    fallback: RwLock<Option<ScriptedResponse>>,
    properties: EngineProperties,
    dialect: Arc<dyn Dialect>,
    counters: Counters,
    refuse_connections: AtomicBool,
}

// ─── Driver ─────────────────────────────────────────────────────────────

/// In-process driver answering from a script. Clones share the script and
/// counters.
#[derive(Debug, Clone)]
pub struct ScriptedDriver {
    shared: Arc<Shared>,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(EngineProperties::new(), Arc::new(AnsiDialect))
    }

    /// Driver consulting `properties` and reporting `dialect`.
    #[must_use]
    pub fn with_parts(properties: EngineProperties, dialect: Arc<dyn Dialect>) -> Self {
        Self {
            shared: Arc::new(Shared {
                script: RwLock::new(HashMap::new()),
                fallback: RwLock::new(None),
                properties,
                dialect,
                counters: Counters::default(),
                refuse_connections: AtomicBool::new(false),
            }),
        }
    }

    /// Answer `query` (compared after trimming) with `response`.
    pub fn script(&self, query: impl AsRef<str>, response: ScriptedResponse) {
        self.shared
            .script
            .write()
            .insert(query.as_ref().trim().to_owned(), response);
    }

    /// Answer every unscripted query with `response`.
    pub fn script_fallback(&self, response: ScriptedResponse) {
        *self.shared.fallback.write() = Some(response);
    }

    /// Make `connect` fail until re-enabled.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn properties(&self) -> &EngineProperties {
        &self.shared.properties
    }

    pub fn stats(&self) -> ScriptStats {
        let c = &self.shared.counters;
        ScriptStats {
            connects: c.connects.load(Ordering::SeqCst),
            open_connections: c.open.load(Ordering::SeqCst),
            max_open_connections: c.max_open.load(Ordering::SeqCst),
            executions: c.executions.load(Ordering::SeqCst),
            cancels: c.cancels.load(Ordering::SeqCst),
            cache_flushes: c.cache_flushes.load(Ordering::SeqCst),
        }
    }

    fn lookup(&self, query: &str) -> Option<ScriptedResponse> {
        self.shared
            .script
            .read()
            .get(query.trim())
            .cloned()
            .or_else(|| self.shared.fallback.read().clone())
    }
}

impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn connect(&self, url: &str, _credentials: &Credentials) -> DriverResult<Arc<dyn Connection>> {
        if self.shared.refuse_connections.load(Ordering::SeqCst) {
            return Err(DriverError::failed(format!("connection refused: {url}")));
        }
        let c = &self.shared.counters;
        c.connects.fetch_add(1, Ordering::SeqCst);
        let open = c.open.fetch_add(1, Ordering::SeqCst) + 1;
        c.max_open.fetch_max(open, Ordering::SeqCst);
        trace!(url, open, "scripted connection opened");
        Ok(Arc::new(ScriptedConnection {
            driver: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

// ─── Connection ─────────────────────────────────────────────────────────

struct ScriptedConnection {
    driver: ScriptedDriver,
    closed: AtomicBool,
}

impl ScriptedConnection {
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.driver.shared.counters.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Connection for ScriptedConnection {
    fn create_statement(&self) -> DriverResult<Box<dyn Statement>> {
        if self.is_closed() {
            return Err(DriverError::ConnectionClosed);
        }
        Ok(Box::new(ScriptedStatement {
            driver: self.driver.clone(),
            control: Arc::new(ScriptedControl {
                driver: self.driver.clone(),
                cancelled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            max_rows: 0,
        }))
    }

    fn dialect(&self) -> Arc<dyn Dialect> {
        Arc::clone(&self.driver.shared.dialect)
    }

    fn flush_cache(&self) -> DriverResult<()> {
        if self.is_closed() {
            return Err(DriverError::ConnectionClosed);
        }
        self.driver
            .shared
            .counters
            .cache_flushes
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> DriverResult<()> {
        self.mark_closed();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

// ─── Statement ──────────────────────────────────────────────────────────

struct ScriptedControl {
    driver: ScriptedDriver,
    cancelled: AtomicBool,
    closed: AtomicBool,
}

impl StatementControl for ScriptedControl {
    fn cancel(&self) -> DriverResult<()> {
        self.driver
            .shared
            .counters
            .cancels
            .fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> DriverResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedStatement {
    driver: ScriptedDriver,
    control: Arc<ScriptedControl>,
    max_rows: usize,
}

impl ScriptedStatement {
    /// Sleep out `latency`, returning early with the interruption cause.
    fn wait(&self, latency: Duration, ignore_cancel: bool) -> DriverResult<()> {
        let deadline = Instant::now() + latency;
        loop {
            if !ignore_cancel {
                if self.control.closed.load(Ordering::SeqCst) {
                    return Err(DriverError::StatementClosed);
                }
                if self.control.cancelled.swap(false, Ordering::SeqCst) {
                    return Err(DriverError::Cancelled);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }

    fn row_limit(&self) -> Option<usize> {
        let property = self
            .driver
            .shared
            .properties
            .get_parsed::<usize>(RESULT_LIMIT)
            .filter(|&n| n > 0);
        let max_rows = (self.max_rows > 0).then_some(self.max_rows);
        match (property, max_rows) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl Statement for ScriptedStatement {
    fn control(&self) -> Arc<dyn StatementControl> {
        Arc::clone(&self.control) as Arc<dyn StatementControl>
    }

    fn set_max_rows(&mut self, max_rows: usize) -> DriverResult<()> {
        if self.control.is_closed() {
            return Err(DriverError::StatementClosed);
        }
        self.max_rows = max_rows;
        Ok(())
    }

    fn execute(&mut self, query: &str, capture: &SqlCapture) -> DriverResult<QueryOutput> {
        if self.control.is_closed() {
            return Err(DriverError::StatementClosed);
        }
        let response = self
            .driver
            .lookup(query)
            .ok_or_else(|| DriverError::failed(format!("no scripted response for query: {query}")))?;
        self.driver
            .shared
            .counters
            .executions
            .fetch_add(1, Ordering::SeqCst);
        for sql in &response.backing_sql {
            capture.record(sql.clone());
        }

        self.wait(response.latency, response.ignore_cancel)?;
        if let Some(err) = response.error {
            return Err(err);
        }

        let mut output = response.output;
        if let (QueryOutput::Rows(rows), Some(limit)) = (&mut output, self.row_limit()) {
            rows.truncate(limit);
        }
        debug!(query, kind = output.kind_name(), "scripted query answered");
        Ok(output)
    }
}
