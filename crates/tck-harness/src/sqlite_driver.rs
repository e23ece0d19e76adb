//! Tabular driver over C SQLite (via `rusqlite`).
//!
//! Cancellation is per statement: while a statement executes it installs a
//! progress handler on the connection that polls the statement's cancel and
//! close flags (and the connection's close flag), so cancelling one
//! statement never interrupts another statement's work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::OpenFlags;
use rusqlite::ffi::ErrorCode;
use rusqlite::types::ValueRef;
use tck_error::{DriverError, DriverResult};
use tck_types::{ColumnMeta, RowSet, SqlType, Value};
use tracing::{debug, warn};

use crate::capture::SqlCapture;
use crate::dialect::{AnsiDialect, Dialect};
use crate::driver::{Connection, Credentials, Driver, QueryOutput, Statement, StatementControl};

/// VM instructions between progress-handler polls.
const PROGRESS_OPS: i32 = 100;

/// Busy timeout applied to every connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver for `sqlite:<path>`, `jdbc:sqlite:<path>`, bare paths and
/// `sqlite::memory:`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    /// Strip any URL scheme, leaving the path handed to SQLite.
    pub fn database_path(url: &str) -> &str {
        let url = url.strip_prefix("jdbc:").unwrap_or(url);
        url.strip_prefix("sqlite:").unwrap_or(url)
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn connect(&self, url: &str, _credentials: &Credentials) -> DriverResult<Arc<dyn Connection>> {
        let path = Self::database_path(url);
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = rusqlite::Connection::open_with_flags(path, flags).map_err(map_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_error)?;
        debug!(path, "sqlite connection opened");
        Ok(Arc::new(SqliteConnection {
            inner: Arc::new(Mutex::new(Some(conn))),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

fn map_error(err: rusqlite::Error) -> DriverError {
    DriverError::failed(err.to_string())
}

// ─── Connection ─────────────────────────────────────────────────────────

pub struct SqliteConnection {
    inner: Arc<Mutex<Option<rusqlite::Connection>>>,
    closed: Arc<AtomicBool>,
}

impl Connection for SqliteConnection {
    fn create_statement(&self) -> DriverResult<Box<dyn Statement>> {
        if self.is_closed() {
            return Err(DriverError::ConnectionClosed);
        }
        Ok(Box::new(SqliteStatement {
            conn: Arc::clone(&self.inner),
            conn_closed: Arc::clone(&self.closed),
            control: Arc::new(SqliteControl::default()),
            max_rows: 0,
        }))
    }

    fn dialect(&self) -> Arc<dyn Dialect> {
        Arc::new(AnsiDialect)
    }

    fn flush_cache(&self) -> DriverResult<()> {
        let guard = self.inner.lock();
        let conn = guard.as_ref().ok_or(DriverError::ConnectionClosed)?;
        conn.flush_prepared_statement_cache();
        conn.execute_batch("PRAGMA shrink_memory;").map_err(map_error)
    }

    fn close(&self) -> DriverResult<()> {
        // Running statements see the flag and interrupt before we take the lock.
        self.closed.store(true, Ordering::SeqCst);
        let Some(conn) = self.inner.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, err)| map_error(err))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ─── Statement ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SqliteControl {
    cancelled: AtomicBool,
    closed: AtomicBool,
}

impl StatementControl for SqliteControl {
    fn cancel(&self) -> DriverResult<()> {
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

pub struct SqliteStatement {
    conn: Arc<Mutex<Option<rusqlite::Connection>>>,
    conn_closed: Arc<AtomicBool>,
    control: Arc<SqliteControl>,
    max_rows: usize,
}

impl Statement for SqliteStatement {
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
        // A cancel that lands before execution starts applies to this run.
        if self.control.cancelled.swap(false, Ordering::SeqCst) {
            return Err(DriverError::Cancelled);
        }

        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(DriverError::ConnectionClosed)?;
        capture.record(query);

        let control = Arc::clone(&self.control);
        let conn_closed = Arc::clone(&self.conn_closed);
        conn.progress_handler(
            PROGRESS_OPS,
            Some(move || {
                control.cancelled.load(Ordering::SeqCst)
                    || control.closed.load(Ordering::SeqCst)
                    || conn_closed.load(Ordering::SeqCst)
            }),
        );
        let result = run_query(conn, query, self.max_rows);
        conn.progress_handler(0, None::<fn() -> bool>);
        drop(guard);

        let cancelled = self.control.cancelled.swap(false, Ordering::SeqCst);
        match result {
            Ok(rows) => Ok(QueryOutput::Rows(rows)),
            Err(err) if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) => {
                if self.control.is_closed() {
                    Err(DriverError::StatementClosed)
                } else if self.conn_closed.load(Ordering::SeqCst) {
                    Err(DriverError::ConnectionClosed)
                } else {
                    if !cancelled {
                        warn!(query, "sqlite interrupted without a cancel request");
                    }
                    Err(DriverError::Cancelled)
                }
            }
            Err(err) => Err(map_error(err)),
        }
    }
}

fn run_query(
    conn: &rusqlite::Connection,
    query: &str,
    max_rows: usize,
) -> Result<RowSet, rusqlite::Error> {
    let mut stmt = conn.prepare(query)?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| (*n).to_owned()).collect();
    let width = names.len();

    let mut values: Vec<Vec<Value>> = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        if max_rows > 0 && values.len() >= max_rows {
            break;
        }
        let mut out = Vec::with_capacity(width);
        for i in 0..width {
            out.push(convert(row.get_ref(i)?));
        }
        values.push(out);
    }

    let columns = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| ColumnMeta::new(name, infer_type(&values, i)))
        .collect();
    Ok(RowSet {
        columns,
        rows: values,
    })
}

fn convert(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::BigInt(i),
        ValueRef::Real(f) => Value::Double(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

/// SQLite types values, not columns: report the class of the first
/// non-null value, or `NULL` for an all-null column.
fn infer_type(rows: &[Vec<Value>], column: usize) -> SqlType {
    rows.iter()
        .filter_map(|r| r.get(column))
        .find(|v| !v.is_null())
        .map_or(SqlType::Null, |v| match v {
            Value::Double(_) => SqlType::Double,
            Value::Text(_) => SqlType::VarChar,
            Value::Bytes(_) => SqlType::VarBinary,
            _ => SqlType::BigInt,
        })
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;

    /// Runs for several seconds unless interrupted.
    const SLOW_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c \
                              WHERE x < 500000000) SELECT count(*) FROM c";

    fn memory() -> Arc<dyn Connection> {
        SqliteDriver
            .connect("sqlite::memory:", &Credentials::default())
            .expect("open in-memory db")
    }

    fn rows(output: QueryOutput) -> RowSet {
        match output {
            QueryOutput::Rows(rows) => rows,
            QueryOutput::CellSet(_) => panic!("sqlite returns rows"),
        }
    }

    #[test]
    fn url_schemes_are_stripped() {
        assert_eq!(SqliteDriver::database_path("jdbc:sqlite:/tmp/x.db"), "/tmp/x.db");
        assert_eq!(SqliteDriver::database_path("sqlite::memory:"), ":memory:");
        assert_eq!(SqliteDriver::database_path("/tmp/y.db"), "/tmp/y.db");
    }

    #[test]
    fn infers_types_and_captures_sql() {
        let conn = memory();
        let mut stmt = conn.create_statement().expect("statement");
        let capture = SqlCapture::new();
        let out = rows(
            stmt.execute("select 266773 as n, 1.5 as d, 'x' as s, null as z", &capture)
                .expect("query"),
        );
        let types: Vec<SqlType> = out.columns.iter().map(|c| c.sql_type).collect();
        assert_eq!(
            types,
            vec![SqlType::BigInt, SqlType::Double, SqlType::VarChar, SqlType::Null]
        );
        assert_eq!(out.rows[0][0], Value::BigInt(266_773));
        assert_eq!(capture.len(), 1);
    }

    #[test]
    fn max_rows_limits_result() {
        let conn = memory();
        let mut stmt = conn.create_statement().expect("statement");
        stmt.set_max_rows(2).expect("max rows");
        let out = rows(
            stmt.execute(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 10) \
                 SELECT x FROM c",
                &SqlCapture::new(),
            )
            .expect("query"),
        );
        assert_eq!(out.row_count(), 2);
    }

    #[test]
    fn cancel_interrupts_only_this_statement() {
        let conn = memory();
        let mut stmt = conn.create_statement().expect("statement");
        let control = stmt.control();
        let started = Instant::now();
        let outcome = thread::scope(|s| {
            let worker = s.spawn(move || stmt.execute(SLOW_QUERY, &SqlCapture::new()));
            thread::sleep(Duration::from_millis(50));
            control.cancel().expect("cancel never fails");
            worker.join().expect("worker thread")
        });
        assert_eq!(outcome, Err(DriverError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));

        // The connection stays usable.
        let mut next = conn.create_statement().expect("statement");
        let out = rows(next.execute("select 1", &SqlCapture::new()).expect("reuse"));
        assert_eq!(out.rows, vec![vec![Value::BigInt(1)]]);
    }

    #[test]
    fn close_interrupts_and_rejects_reuse() {
        let conn = memory();
        let mut stmt = conn.create_statement().expect("statement");
        let control = stmt.control();
        let outcome = thread::scope(|s| {
            let worker = s.spawn(|| stmt.execute(SLOW_QUERY, &SqlCapture::new()));
            thread::sleep(Duration::from_millis(50));
            control.close().expect("close never fails");
            worker.join().expect("worker thread")
        });
        assert_eq!(outcome, Err(DriverError::StatementClosed));
        assert!(control.is_closed());
        assert_eq!(
            stmt.execute("select 1", &SqlCapture::new()),
            Err(DriverError::StatementClosed)
        );
    }

    #[test]
    fn cancel_before_execute_applies_once() {
        let conn = memory();
        let mut stmt = conn.create_statement().expect("statement");
        stmt.control().cancel().expect("cancel");
        assert_eq!(
            stmt.execute("select 1", &SqlCapture::new()),
            Err(DriverError::Cancelled)
        );
        assert!(stmt.execute("select 1", &SqlCapture::new()).is_ok());
    }

    #[test]
    fn closed_connection_rejects_statements() {
        let conn = memory();
        conn.close().expect("close");
        assert!(conn.is_closed());
        assert!(matches!(
            conn.create_statement(),
            Err(DriverError::ConnectionClosed)
        ));
        conn.close().expect("second close is a no-op");
    }

    #[test]
    fn flush_cache_succeeds() {
        let conn = memory();
        conn.flush_cache().expect("flush");
    }

    #[test]
    fn sql_errors_are_failures() {
        let conn = memory();
        let mut stmt = conn.create_statement().expect("statement");
        let err = stmt
            .execute("select * from missing_table", &SqlCapture::new())
            .expect_err("no such table");
        assert!(matches!(err, DriverError::Failed(ref m) if m.contains("missing_table")));
    }
}
