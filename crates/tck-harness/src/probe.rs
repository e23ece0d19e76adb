//! Cancel-then-reuse probe: a connection must stay usable after one of its
//! statements is cancelled and closed mid-flight.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tck_error::{Result, TckError};
use tracing::{debug, info};

use crate::capture::SqlCapture;
use crate::pool::{ConnectionFactory, ConnectionLease};

/// Minimum wait before the probe cancels the first query.
pub const PROBE_DELAY: Duration = Duration::from_millis(50);

/// What one probe observed.
#[derive(Debug)]
pub struct ProbeOutcome {
    pub cancelled_query: String,
    pub follow_up_query: String,
    /// Whether the first query ended by cancellation rather than completing.
    pub first_cancelled: bool,
    pub errors: Vec<TckError>,
}

impl ProbeOutcome {
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Start a query on a worker thread, cancel and close its statement after a
/// short wait, then run a second query on the same connection (or a new one
/// when `reconnect`).
///
/// Both queries are drawn from `queries` with `seed`. Worker errors are
/// collected into the outcome; only setup failures are returned as `Err`.
pub fn probe_cancel_and_reuse(
    factory: &Arc<ConnectionFactory>,
    queries: &[String],
    reconnect: bool,
    seed: u64,
) -> Result<ProbeOutcome> {
    let mut rng = StdRng::seed_from_u64(seed);
    let cancelled_query = queries
        .choose(&mut rng)
        .ok_or_else(|| TckError::configuration("probe needs at least one query"))?
        .clone();
    let follow_up_query = queries.choose(&mut rng).cloned().unwrap_or_default();
    let delay = PROBE_DELAY + Duration::from_millis(rng.gen_range(0..=50));

    let mut errors = Vec::new();
    let lease = factory.acquire()?;
    let mut statement = lease
        .create_statement()
        .map_err(|e| TckError::driver(&cancelled_query, e))?;
    let control = statement.control();

    let first = thread::scope(|s| {
        let worker = s.spawn(|| statement.execute(&cancelled_query, &SqlCapture::new()));
        thread::sleep(delay);
        if control.is_closed() {
            errors.push(TckError::harness("statement closed before the probe cancelled it"));
        }
        if let Err(err) = control.cancel().and_then(|()| control.close()) {
            errors.push(TckError::driver(&cancelled_query, err));
        }
        worker.join()
    });
    let first_cancelled = match first {
        Ok(Ok(_)) => false,
        Ok(Err(err)) if err.is_cancellation() => true,
        Ok(Err(err)) => {
            errors.push(TckError::driver(&cancelled_query, err));
            false
        }
        Err(_) => {
            errors.push(TckError::harness("probe worker panicked"));
            false
        }
    };
    drop(statement);
    debug!(query = %cancelled_query, first_cancelled, "probe first query finished");

    let lease: ConnectionLease = if reconnect {
        drop(lease);
        factory.acquire()?
    } else {
        lease
    };
    let follow_up = lease
        .create_statement()
        .and_then(|mut stmt| stmt.execute(&follow_up_query, &SqlCapture::new()));
    if let Err(err) = follow_up {
        errors.push(TckError::driver(&follow_up_query, err));
    }

    info!(
        reconnect,
        first_cancelled,
        errors = errors.len(),
        "cancel-and-reuse probe finished"
    );
    Ok(ProbeOutcome {
        cancelled_query,
        follow_up_query,
        first_cancelled,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use tck_types::{ColumnMeta, RowSet, SqlType, Value};

    use super::*;
    use crate::driver::{Credentials, Driver};
    use crate::mock::{ScriptedDriver, ScriptedResponse};
    use crate::pool::ConnectionSource;

    fn setup(source: ConnectionSource) -> (ScriptedDriver, Arc<ConnectionFactory>) {
        let driver = ScriptedDriver::new();
        let rows = RowSet::new(vec![ColumnMeta::new("n", SqlType::BigInt)]).with_row([Value::BigInt(1)]);
        driver.script("slow", ScriptedResponse::rows(rows).with_latency(Duration::from_millis(400)));
        let dyn_driver: Arc<dyn Driver> = Arc::new(driver.clone());
        let factory =
            ConnectionFactory::new(dyn_driver, "scripted:probe", Credentials::default(), source, Duration::from_secs(1))
                .expect("factory");
        (driver, factory)
    }

    #[test]
    fn cancelled_connection_is_reused() {
        let (driver, factory) = setup(ConnectionSource::Single);
        let queries = vec!["slow".to_owned()];
        let outcome = probe_cancel_and_reuse(&factory, &queries, false, 3).expect("probe");
        assert!(outcome.first_cancelled);
        assert!(outcome.passed(), "{:?}", outcome.errors);
        assert_eq!(driver.stats().connects, 1);
        assert_eq!(driver.stats().cancels, 1);
        assert_eq!(driver.stats().executions, 2);
    }

    #[test]
    fn reconnect_opens_a_new_connection() {
        let (driver, factory) = setup(ConnectionSource::PerCall);
        let outcome = probe_cancel_and_reuse(&factory, &["slow".to_owned()], true, 9).expect("probe");
        assert!(outcome.first_cancelled);
        assert_eq!(driver.stats().connects, 2);
        assert!(outcome.passed(), "{:?}", outcome.errors);
    }

    #[test]
    fn empty_query_list_is_a_configuration_error() {
        let (_, factory) = setup(ConnectionSource::Single);
        let err = probe_cancel_and_reuse(&factory, &[], false, 1).expect_err("empty");
        assert!(err.is_fatal());
    }
}
