//! Capability contracts a driver under test must provide.
//!
//! A [`Driver`] opens [`Connection`]s; a connection hands out [`Statement`]s
//! that run one query at a time. Each statement exposes a shareable
//! [`StatementControl`] so another thread can cancel or close it while
//! `execute` is blocked.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tck_error::DriverResult;
use tck_types::{CellSet, RowSet};

use crate::capture::SqlCapture;
use crate::dialect::Dialect;

/// Login credentials passed to [`Driver::connect`].
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            password: Some(password.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// What a statement produced.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    /// Tabular result.
    Rows(RowSet),
    /// Multidimensional result.
    CellSet(CellSet),
}

impl QueryOutput {
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Rows(_) => "result set",
            Self::CellSet(_) => "cell set",
        }
    }
}

/// Entry point of a driver implementation.
pub trait Driver: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Open a new connection.
    fn connect(&self, url: &str, credentials: &Credentials) -> DriverResult<Arc<dyn Connection>>;
}

/// A live connection. Shared between a pool and its leases, so all methods
/// take `&self`.
pub trait Connection: Send + Sync {
    fn create_statement(&self) -> DriverResult<Box<dyn Statement>>;

    fn dialect(&self) -> Arc<dyn Dialect>;

    /// Drop any server-side result caches before the next query.
    fn flush_cache(&self) -> DriverResult<()>;

    fn close(&self) -> DriverResult<()>;

    fn is_closed(&self) -> bool;
}

/// One executable statement, owned by the thread that runs it.
pub trait Statement: Send {
    /// Handle usable from other threads while `execute` runs.
    fn control(&self) -> Arc<dyn StatementControl>;

    /// Limit the number of rows returned; `0` means unlimited.
    fn set_max_rows(&mut self, max_rows: usize) -> DriverResult<()>;

    /// Run `query`, recording every SQL string sent to the database in
    /// `capture`.
    fn execute(&mut self, query: &str, capture: &SqlCapture) -> DriverResult<QueryOutput>;
}

/// Cross-thread control surface of a [`Statement`].
///
/// `cancel` and `close` may race with each other and with completion;
/// implementations must tolerate being called on a finished or closed
/// statement.
pub trait StatementControl: Send + Sync {
    fn cancel(&self) -> DriverResult<()>;

    fn close(&self) -> DriverResult<()>;

    fn is_closed(&self) -> bool;
}
