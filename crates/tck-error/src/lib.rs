use thiserror::Error;

/// Errors raised by a driver under test.
///
/// Drivers report failures through this type so the harness can tell a
/// cancellation (expected while racing) apart from a genuine fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The statement was cancelled while executing.
    #[error("statement cancelled")]
    Cancelled,

    /// The statement was closed before or while executing.
    #[error("statement is closed")]
    StatementClosed,

    /// The owning connection was closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The driver does not implement the requested operation.
    #[error("unsupported by driver: {0}")]
    Unsupported(String),

    /// Any other driver-side failure.
    #[error("{0}")]
    Failed(String),
}

impl DriverError {
    /// Whether this error is the normal outcome of a cancel/close race.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::StatementClosed)
    }

    /// Create a generic driver failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Result type alias for driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Primary error type for the compliance kit.
#[derive(Error, Debug)]
pub enum TckError {
    // === Verification ===
    /// The comparator found at least one difference.
    #[error("assertion mismatch for query `{query}`:\n{}", .mismatches.join("\n"))]
    AssertionMismatch {
        query: String,
        mismatches: Vec<String>,
    },

    /// A driver call failed while running `query`.
    #[error("query failed to run successfully: `{query}`: {source}")]
    DriverFault {
        query: String,
        #[source]
        source: DriverError,
    },

    /// A scheduled cancellation and the query completion raced incorrectly.
    #[error("cancellation race violation for query `{query}`: {detail}")]
    CancellationRaceViolation { query: String, detail: String },

    /// `verify` was invoked on a context that already ran.
    #[error("execution context is stale (state: {state})")]
    StaleContextUse { state: String },

    // === Setup ===
    /// Invalid expectation, configuration or fixture.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Could not obtain a connection within the acquire timeout.
    #[error("connection pool exhausted for '{url}': capacity {capacity}, waited {waited_ms}ms")]
    PoolExhausted {
        url: String,
        capacity: usize,
        waited_ms: u64,
    },

    /// Opening a connection failed.
    #[error("cannot connect to '{url}': {source}")]
    Connect {
        url: String,
        #[source]
        source: DriverError,
    },

    /// Harness bookkeeping failure (worker panic, shutdown overrun).
    #[error("harness failure: {0}")]
    Harness(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`TckError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    AssertionMismatch,
    DriverFault,
    CancellationRaceViolation,
    StaleContextUse,
    Configuration,
    Resource,
}

impl TckError {
    /// Map this error onto its taxonomy category.
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::AssertionMismatch { .. } => ErrorCategory::AssertionMismatch,
            Self::DriverFault { .. } | Self::Connect { .. } => ErrorCategory::DriverFault,
            Self::CancellationRaceViolation { .. } => ErrorCategory::CancellationRaceViolation,
            Self::StaleContextUse { .. } => ErrorCategory::StaleContextUse,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::PoolExhausted { .. } | Self::Harness(_) | Self::Io(_) => ErrorCategory::Resource,
        }
    }

    /// Programming errors that must abort the calling test immediately.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StaleContextUse { .. } | Self::Configuration(_)
        )
    }

    /// Whether the wrapped driver error is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::DriverFault { source, .. } if source.is_cancellation())
    }

    /// Wrap a driver error with the query that triggered it.
    pub fn driver(query: impl Into<String>, source: DriverError) -> Self {
        Self::DriverFault {
            query: query.into(),
            source,
        }
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a cancellation race violation.
    pub fn race(query: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::CancellationRaceViolation {
            query: query.into(),
            detail: detail.into(),
        }
    }

    /// Create a harness error.
    pub fn harness(msg: impl Into<String>) -> Self {
        Self::Harness(msg.into())
    }
}

/// Result type alias using `TckError`.
pub type Result<T> = std::result::Result<T, TckError>;
