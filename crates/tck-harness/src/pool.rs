//! Connection sources: one shared connection, a fresh connection per call,
//! or a bounded pool.
//!
//! A [`ConnectionLease`] belongs to one caller for one query. Dropping it
//! returns the connection to the pool, closes it (per-call source) or leaves
//! it open (shared source), on every exit path.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tck_error::{Result, TckError};
use tracing::{debug, warn};

use crate::driver::{Connection, Credentials, Driver};

/// How connections are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionSource {
    /// One connection shared by every caller.
    Single,
    /// A new connection for every lease, closed on release.
    PerCall,
    /// At most `size` connections, reused across leases.
    Pooled { size: usize },
}

impl fmt::Display for ConnectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => f.write_str("single"),
            Self::PerCall => f.write_str("per-call"),
            Self::Pooled { size } => write!(f, "pooled({size})"),
        }
    }
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Arc<dyn Connection>>,
    shared: Option<Arc<dyn Connection>>,
    /// Connections opened and not yet discarded (idle + leased).
    open: usize,
    leased: usize,
    shut_down: bool,
}

/// Hands out connections to one database URL.
pub struct ConnectionFactory {
    driver: Arc<dyn Driver>,
    url: String,
    credentials: Credentials,
    source: ConnectionSource,
    acquire_timeout: Duration,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("driver", &self.driver.name())
            .field("url", &self.url)
            .field("source", &self.source)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

/// Counters describing a factory's connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatus {
    pub open: usize,
    pub idle: usize,
    pub leased: usize,
}

impl ConnectionFactory {
    /// Create a factory; no connection is opened until the first lease.
    pub fn new(
        driver: Arc<dyn Driver>,
        url: impl Into<String>,
        credentials: Credentials,
        source: ConnectionSource,
        acquire_timeout: Duration,
    ) -> Result<Arc<Self>> {
        if source == (ConnectionSource::Pooled { size: 0 }) {
            return Err(TckError::configuration("pool size must be at least 1"));
        }
        Ok(Arc::new(Self {
            driver,
            url: url.into(),
            credentials,
            source,
            acquire_timeout,
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn source(&self) -> ConnectionSource {
        self.source
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            open: state.open,
            idle: state.idle.len(),
            leased: state.leased,
        }
    }

    fn connect(&self) -> Result<Arc<dyn Connection>> {
        self.driver
            .connect(&self.url, &self.credentials)
            .map_err(|source| TckError::Connect {
                url: self.url.clone(),
                source,
            })
    }

    /// Lease a connection, blocking up to the acquire timeout when the pool
    /// is exhausted.
    ///
    /// # Errors
    ///
    /// [`TckError::PoolExhausted`] on timeout, [`TckError::Connect`] when the
    /// driver refuses, [`TckError::Harness`] after shutdown.
    pub fn acquire(self: &Arc<Self>) -> Result<ConnectionLease> {
        let conn = match self.source {
            ConnectionSource::Single => self.acquire_shared()?,
            ConnectionSource::PerCall => {
                self.ensure_running()?;
                let conn = self.connect()?;
                let mut state = self.state.lock();
                state.open += 1;
                state.leased += 1;
                conn
            }
            ConnectionSource::Pooled { size } => self.acquire_pooled(size)?,
        };
        Ok(ConnectionLease {
            factory: Arc::clone(self),
            conn,
        })
    }

    fn shut_down_error(&self) -> TckError {
        TckError::harness(format!(
            "connection factory for '{}' is shut down",
            self.url
        ))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state.lock().shut_down {
            Err(self.shut_down_error())
        } else {
            Ok(())
        }
    }

    fn acquire_shared(&self) -> Result<Arc<dyn Connection>> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(self.shut_down_error());
        }
        if let Some(conn) = state.shared.as_ref().filter(|c| !c.is_closed()) {
            let conn = Arc::clone(conn);
            state.leased += 1;
            return Ok(conn);
        }
        if state.shared.take().is_some() {
            state.open -= 1;
        }
        let conn = self.connect()?;
        state.shared = Some(Arc::clone(&conn));
        state.open += 1;
        state.leased += 1;
        Ok(conn)
    }

    fn acquire_pooled(&self, size: usize) -> Result<Arc<dyn Connection>> {
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;
        let mut state = self.state.lock();
        loop {
            if state.shut_down {
                return Err(self.shut_down_error());
            }
            if let Some(conn) = state.idle.pop() {
                if conn.is_closed() {
                    state.open -= 1;
                    continue;
                }
                state.leased += 1;
                return Ok(conn);
            }
            if state.open < size {
                state.open += 1;
                state.leased += 1;
                drop(state);
                return self.connect().inspect_err(|_| {
                    let mut state = self.state.lock();
                    state.open -= 1;
                    state.leased -= 1;
                    self.released.notify_one();
                });
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                warn!(url = %self.url, size, waited_ms, "connection pool exhausted");
                return Err(TckError::PoolExhausted {
                    url: self.url.clone(),
                    capacity: size,
                    waited_ms,
                });
            }
        }
    }

    fn release(&self, conn: Arc<dyn Connection>) {
        let mut state = self.state.lock();
        state.leased -= 1;
        let discard = match self.source {
            ConnectionSource::Single => false,
            ConnectionSource::PerCall => true,
            ConnectionSource::Pooled { .. } => state.shut_down || conn.is_closed(),
        };
        if discard {
            state.open -= 1;
            drop(state);
            close_quietly(&*conn, &self.url);
        } else if matches!(self.source, ConnectionSource::Pooled { .. }) {
            state.idle.push(conn);
            drop(state);
        } else {
            drop(state);
        }
        self.released.notify_one();
    }

    /// Close idle and shared connections and refuse further leases. Leased
    /// connections are closed as they come back.
    pub fn shutdown(&self) {
        let (idle, shared) = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let idle = std::mem::take(&mut state.idle);
            let shared = state.shared.take();
            state.open -= idle.len() + usize::from(shared.is_some());
            (idle, shared)
        };
        debug!(url = %self.url, source = %self.source, closing = idle.len(), "connection factory shut down");
        for conn in idle.iter().chain(shared.iter()) {
            close_quietly(&**conn, &self.url);
        }
        self.released.notify_all();
    }
}

fn close_quietly(conn: &dyn Connection, url: &str) {
    if let Err(err) = conn.close() {
        warn!(url, error = %err, "closing connection failed");
    }
}

/// A connection leased from a [`ConnectionFactory`].
pub struct ConnectionLease {
    factory: Arc<ConnectionFactory>,
    conn: Arc<dyn Connection>,
}

impl ConnectionLease {
    pub fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.factory
    }

    /// The shared handle, for holders that outlive the borrow.
    pub fn handle(&self) -> Arc<dyn Connection> {
        Arc::clone(&self.conn)
    }
}

impl Deref for ConnectionLease {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &*self.conn
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.factory.release(Arc::clone(&self.conn));
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::mock::ScriptedDriver;

    fn factory(driver: &ScriptedDriver, source: ConnectionSource) -> Arc<ConnectionFactory> {
        ConnectionFactory::new(
            Arc::new(driver.clone()),
            "scripted:pool",
            Credentials::default(),
            source,
            Duration::from_millis(100),
        )
        .expect("factory")
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let driver = ScriptedDriver::new();
        let err = ConnectionFactory::new(
            Arc::new(driver),
            "x",
            Credentials::default(),
            ConnectionSource::Pooled { size: 0 },
            Duration::from_millis(1),
        )
        .expect_err("size 0");
        assert!(err.is_fatal());
    }

    #[test]
    fn pooled_connections_are_reused() {
        let driver = ScriptedDriver::new();
        let pool = factory(&driver, ConnectionSource::Pooled { size: 2 });
        for _ in 0..5 {
            let lease = pool.acquire().expect("lease");
            assert!(!lease.is_closed());
        }
        assert_eq!(driver.stats().connects, 1);
        assert_eq!(pool.status(), PoolStatus { open: 1, idle: 1, leased: 0 });
        pool.shutdown();
        assert_eq!(driver.stats().open_connections, 0);
        assert!(pool.acquire().is_err());
    }

    #[test]
    fn exhausted_pool_times_out() {
        let driver = ScriptedDriver::new();
        let pool = factory(&driver, ConnectionSource::Pooled { size: 1 });
        let held = pool.acquire().expect("lease");
        let err = pool.acquire().err().expect("exhausted");
        assert!(matches!(err, TckError::PoolExhausted { capacity: 1, .. }), "{err}");
        drop(held);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn waiter_gets_released_connection() {
        let driver = ScriptedDriver::new();
        let pool = ConnectionFactory::new(
            Arc::new(driver.clone()),
            "scripted:pool",
            Credentials::default(),
            ConnectionSource::Pooled { size: 1 },
            Duration::from_secs(5),
        )
        .expect("factory");
        let held = pool.acquire().expect("lease");
        thread::scope(|s| {
            let waiter = s.spawn(|| pool.acquire().map(|_| ()));
            thread::sleep(Duration::from_millis(30));
            drop(held);
            assert!(waiter.join().expect("waiter").is_ok());
        });
        assert_eq!(driver.stats().max_open_connections, 1);
    }

    #[test]
    fn per_call_connections_are_closed_on_release() {
        let driver = ScriptedDriver::new();
        let source = factory(&driver, ConnectionSource::PerCall);
        {
            let _a = source.acquire().expect("lease");
            let _b = source.acquire().expect("lease");
            assert_eq!(driver.stats().open_connections, 2);
        }
        assert_eq!(driver.stats().open_connections, 0);
        assert_eq!(source.status(), PoolStatus::default());
    }

    #[test]
    fn single_connection_is_shared_and_reopened() {
        let driver = ScriptedDriver::new();
        let source = factory(&driver, ConnectionSource::Single);
        {
            let a = source.acquire().expect("lease");
            let _b = source.acquire().expect("lease");
            assert_eq!(driver.stats().open_connections, 1);
            a.close().expect("close");
        }
        let c = source.acquire().expect("reopen");
        assert!(!c.is_closed());
        assert_eq!(driver.stats().connects, 2);
        drop(c);
        source.shutdown();
        assert_eq!(driver.stats().open_connections, 0);
    }

    #[test]
    fn closed_pooled_connection_is_discarded() {
        let driver = ScriptedDriver::new();
        let pool = factory(&driver, ConnectionSource::Pooled { size: 1 });
        {
            let lease = pool.acquire().expect("lease");
            lease.close().expect("close");
        }
        assert_eq!(pool.status().open, 0);
        assert!(!pool.acquire().expect("fresh").is_closed());
    }

    #[test]
    fn refused_connect_frees_the_slot() {
        let driver = ScriptedDriver::new();
        let pool = factory(&driver, ConnectionSource::Pooled { size: 1 });
        driver.refuse_connections(true);
        assert!(matches!(pool.acquire().err(), Some(TckError::Connect { .. })));
        driver.refuse_connections(false);
        assert!(pool.acquire().is_ok());
    }
}
