//! Per-execution record of the SQL a driver issues.

use parking_lot::Mutex;
use tracing::debug;

/// Ordered, append-only buffer of SQL statements observed while running one
/// logical query.
///
/// An [`crate::context::ExecutionContext`] creates a fresh capture for every
/// `verify` and hands it to the statement's `execute`; drivers push each SQL
/// string they send to the database. Drivers may record from helper threads,
/// so the buffer is internally synchronized.
#[derive(Debug, Default)]
pub struct SqlCapture {
    statements: Mutex<Vec<String>>,
}

impl SqlCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sql: impl Into<String>) {
        let sql = sql.into();
        debug!(target: "tck_harness::capture", sql = %sql, "captured sql");
        self.statements.lock().push(sql);
    }

    pub fn len(&self) -> usize {
        self.statements.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.lock().is_empty()
    }

    /// Copy of everything recorded so far, in order.
    pub fn snapshot(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    /// Consume the capture and return the recorded statements.
    pub fn into_statements(self) -> Vec<String> {
        self.statements.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::SqlCapture;

    #[test]
    fn keeps_insertion_order() {
        let capture = SqlCapture::new();
        assert!(capture.is_empty());
        capture.record("select 1");
        capture.record(String::from("select 2"));
        assert_eq!(capture.len(), 2);
        assert_eq!(capture.snapshot(), vec!["select 1", "select 2"]);
        assert_eq!(capture.into_statements(), vec!["select 1", "select 2"]);
    }

    #[test]
    fn records_from_several_threads() {
        let capture = Arc::new(SqlCapture::new());
        std::thread::scope(|s| {
            for t in 0..4 {
                let capture = Arc::clone(&capture);
                s.spawn(move || {
                    for i in 0..25 {
                        capture.record(format!("select {t}, {i}"));
                    }
                });
            }
        });
        assert_eq!(capture.len(), 100);
    }
}
