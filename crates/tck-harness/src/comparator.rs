//! Result comparison: actual output and captured SQL against an
//! [`Expectation`].
//!
//! The comparator never stops at the first difference within a dimension it
//! can keep scanning; every mismatch is collected so one failing run reports
//! everything that is wrong with it. An empty mismatch list is the only
//! passing result.

use std::fmt;

use serde::{Deserialize, Serialize};
use tck_error::{Result, TckError};
use tck_types::{RowSet, SqlType, ValueKind};

use crate::driver::QueryOutput;
use crate::expectation::Expectation;
use crate::normalize;
use crate::render;

// ─── Compliance level ───────────────────────────────────────────────────

/// How much of an expectation is enforced.
///
/// - `Execution` (1): the query runs and the expected SQL is issued
/// - `Content` (2): plus column names and row content
/// - `Types` (3): plus driver type codes and value classes
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum ComplianceLevel {
    Execution = 1,
    Content = 2,
    #[default]
    Types = 3,
}

impl TryFrom<u8> for ComplianceLevel {
    type Error = TckError;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            1 => Ok(Self::Execution),
            2 => Ok(Self::Content),
            3 => Ok(Self::Types),
            other => Err(TckError::configuration(format!(
                "compliance level must be 1, 2 or 3 (got {other})"
            ))),
        }
    }
}

impl From<ComplianceLevel> for u8 {
    fn from(level: ComplianceLevel) -> Self {
        level as Self
    }
}

// ─── Mismatches ─────────────────────────────────────────────────────────

/// One difference between expected and actual.
#[derive(Debug, Clone, PartialEq)]
pub enum Mismatch {
    /// Exact column list differs.
    ColumnSequence {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    /// A partially declared column is absent.
    MissingColumn { column: String, actual: Vec<String> },
    /// More rows than declared (non-partial).
    TooManyRows { expected: usize },
    /// Fewer rows than declared.
    TooFewRows { expected: usize, actual: usize },
    RowContent {
        index: usize,
        expected: String,
        actual: String,
    },
    /// Driver-reported type code differs.
    MetaType {
        column: String,
        expected: SqlType,
        actual: SqlType,
    },
    /// A value's runtime class is outside the allow-list for its type.
    ValueType {
        column: String,
        row: usize,
        expected: &'static str,
        actual: ValueKind,
    },
    CellSetText { expected: String, actual: String },
    /// A fragment was not found in any captured statement.
    MissingSql {
        fragment: String,
        captured: Vec<String>,
    },
    /// The driver produced the other kind of output.
    UnexpectedOutput {
        expected: &'static str,
        actual: &'static str,
    },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColumnSequence { expected, actual } => write!(
                f,
                "column names do not correspond to those expected: expected {expected:?}, actual {actual:?}"
            ),
            Self::MissingColumn { column, actual } => write!(
                f,
                "column '{column}' doesn't exist in the result set columns {actual:?}"
            ),
            Self::TooManyRows { expected } => {
                write!(f, "too many rows: result returned more than the {expected} expected")
            }
            Self::TooFewRows { expected, actual } => write!(
                f,
                "too few rows: expected {expected}, result ended after {actual}"
            ),
            Self::RowContent {
                index,
                expected,
                actual,
            } => write!(
                f,
                "row {index} content doesn't match: expected \"{expected}\", actual \"{actual}\""
            ),
            Self::MetaType {
                column,
                expected,
                actual,
            } => write!(
                f,
                "wrong meta type for column {column}: expected {expected}, actual {actual}"
            ),
            Self::ValueType {
                column,
                row,
                expected,
                actual,
            } => write!(
                f,
                "wrong type for column {column} in row {row}: expected {expected}, value class was {actual}"
            ),
            Self::CellSetText { expected, actual } => write!(
                f,
                "cell set doesn't match:\n--- expected\n{expected}\n--- actual\n{actual}"
            ),
            Self::MissingSql { fragment, captured } => write!(
                f,
                "expected sql was not executed:\n{fragment}\n({} statements captured)",
                captured.len()
            ),
            Self::UnexpectedOutput { expected, actual } => {
                write!(f, "expected a {expected} but the driver returned a {actual}")
            }
        }
    }
}

// ─── Comparison result ──────────────────────────────────────────────────

/// Outcome of one verification.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonResult {
    pub query: String,
    pub mismatches: Vec<Mismatch>,
    /// SQL captured during execution, in order.
    pub captured_sql: Vec<String>,
    /// Whether the query was cancelled instead of completing.
    pub cancelled: bool,
}

impl ComparisonResult {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Turn a failing result into [`TckError::AssertionMismatch`].
    pub fn assert_passed(self) -> Result<Self> {
        if self.passed() {
            Ok(self)
        } else {
            Err(TckError::AssertionMismatch {
                query: self.query,
                mismatches: self.mismatches.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

// ─── Comparator ─────────────────────────────────────────────────────────

/// Compare an execution's output and captured SQL to `expectation`.
///
/// `quote` is the driver dialect's identifier quote string.
///
/// # Errors
///
/// [`TckError::Configuration`] when the expectation declares a type with no
/// value-class allow-list, or a type list whose length does not match the
/// compared columns.
pub fn compare(
    expectation: &Expectation,
    output: &QueryOutput,
    captured: &[String],
    quote: &str,
    level: ComplianceLevel,
) -> Result<Vec<Mismatch>> {
    let mut mismatches = Vec::new();
    match (expectation.expect_result_set(), output) {
        (true, QueryOutput::Rows(rows)) => {
            mismatches.extend(compare_rows(expectation, rows, level)?);
        }
        (false, QueryOutput::CellSet(cell_set)) => {
            if let Some(expected) = expectation.cell_set_text() {
                let actual = render::cell_set_to_string(cell_set);
                if normalize::clean_line_endings(expected) != actual {
                    mismatches.push(Mismatch::CellSetText {
                        expected: expected.to_owned(),
                        actual,
                    });
                }
            }
        }
        (true, other) => mismatches.push(Mismatch::UnexpectedOutput {
            expected: "result set",
            actual: other.kind_name(),
        }),
        (false, other) => mismatches.push(Mismatch::UnexpectedOutput {
            expected: "cell set",
            actual: other.kind_name(),
        }),
    }
    mismatches.extend(compare_sql(expectation.sql_fragments(), captured, quote));
    Ok(mismatches)
}

/// Fragments missing from the captured SQL.
pub fn compare_sql(fragments: &[String], captured: &[String], quote: &str) -> Vec<Mismatch> {
    normalize::missing_fragments(fragments, captured, quote)
        .into_iter()
        .map(|fragment| Mismatch::MissingSql {
            fragment: normalize::normalize_sql(fragment, quote),
            captured: captured.to_vec(),
        })
        .collect()
}

/// Columns, rows and types of a tabular result.
pub fn compare_rows(
    expectation: &Expectation,
    rows: &RowSet,
    level: ComplianceLevel,
) -> Result<Vec<Mismatch>> {
    let mut mismatches = Vec::new();
    let included = included_columns(expectation, rows);

    if level >= ComplianceLevel::Content {
        if let Some(expected) = expectation.columns() {
            mismatches.extend(compare_columns(expected, expectation.columns_partial(), rows));
        }
        if let Some(expected) = expectation.rows() {
            mismatches.extend(compare_row_content(
                expected,
                expectation.partial(),
                rows,
                &included,
            ));
        }
    }

    if level >= ComplianceLevel::Types {
        if let Some(types) = expectation.types() {
            mismatches.extend(compare_types(types, rows, &included)?);
        }
    }
    Ok(mismatches)
}

/// Indices of the actual columns that take part in row rendering and type
/// checks: all of them, or with partial columns only those named
/// (case-insensitively) in the expectation.
fn included_columns(expectation: &Expectation, rows: &RowSet) -> Vec<usize> {
    match expectation.columns() {
        Some(expected) if expectation.columns_partial() => {
            let wanted: Vec<String> = expected.iter().map(|c| c.to_lowercase()).collect();
            rows.columns
                .iter()
                .enumerate()
                .filter(|(_, c)| wanted.contains(&c.name.to_lowercase()))
                .map(|(i, _)| i)
                .collect()
        }
        _ => (0..rows.columns.len()).collect(),
    }
}

fn compare_columns(expected: &[String], partial: bool, rows: &RowSet) -> Vec<Mismatch> {
    // Drivers disagree on identifier case.
    let actual: Vec<String> = rows.columns.iter().map(|c| c.name.to_lowercase()).collect();
    if partial {
        expected
            .iter()
            .filter(|c| !actual.contains(&c.to_lowercase()))
            .map(|c| Mismatch::MissingColumn {
                column: c.clone(),
                actual: actual.clone(),
            })
            .collect()
    } else {
        let same = expected.len() == actual.len()
            && expected
                .iter()
                .zip(&actual)
                .all(|(e, a)| e.to_lowercase() == *a);
        if same {
            Vec::new()
        } else {
            vec![Mismatch::ColumnSequence {
                expected: expected.to_vec(),
                actual,
            }]
        }
    }
}

fn compare_row_content(
    expected: &[String],
    partial: bool,
    rows: &RowSet,
    included: &[usize],
) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    for (index, row) in rows.rows.iter().enumerate() {
        if index >= expected.len() {
            if !partial {
                mismatches.push(Mismatch::TooManyRows {
                    expected: expected.len(),
                });
            }
            break;
        }
        let actual = render::render_row(row, &rows.columns, |i| included.contains(&i));
        if actual != expected[index] {
            mismatches.push(Mismatch::RowContent {
                index,
                expected: expected[index].clone(),
                actual,
            });
        }
    }
    if rows.rows.len() < expected.len() {
        mismatches.push(Mismatch::TooFewRows {
            expected: expected.len(),
            actual: rows.rows.len(),
        });
    }
    mismatches
}

/// Value classes accepted for a declared type; `None` means the type has no
/// allow-list. `OTHER` accepts everything.
pub fn allowed_kinds(sql_type: SqlType) -> Option<(&'static str, &'static [ValueKind])> {
    Some(match sql_type {
        SqlType::BigInt => ("Long", &[ValueKind::Long]),
        SqlType::Decimal => ("Double / BigDecimal", &[ValueKind::Double, ValueKind::BigDecimal]),
        SqlType::Boolean => ("Boolean", &[ValueKind::Boolean]),
        SqlType::Integer | SqlType::SmallInt => ("Integer", &[ValueKind::Integer, ValueKind::Short]),
        SqlType::VarChar | SqlType::Char => ("String", &[ValueKind::String]),
        SqlType::Double => ("Double", &[ValueKind::Double]),
        SqlType::TinyInt => ("Byte", &[ValueKind::Byte]),
        _ => return None,
    })
}

fn compare_types(
    types: &[SqlType],
    rows: &RowSet,
    included: &[usize],
) -> Result<Vec<Mismatch>> {
    if types.len() != included.len() {
        return Err(TckError::configuration(format!(
            "{} expected types declared for {} compared columns",
            types.len(),
            included.len()
        )));
    }
    let mut allow_lists = Vec::with_capacity(types.len());
    for &t in types {
        if t == SqlType::Other {
            allow_lists.push(None);
        } else {
            let allowed = allowed_kinds(t).ok_or_else(|| {
                TckError::configuration(format!("expected type check not implemented for {t}"))
            })?;
            allow_lists.push(Some(allowed));
        }
    }

    let mut mismatches = Vec::new();
    for (&col, &expected) in included.iter().zip(types) {
        let column = &rows.columns[col];
        if expected != SqlType::Other && column.sql_type != expected {
            mismatches.push(Mismatch::MetaType {
                column: column.name.clone(),
                expected,
                actual: column.sql_type,
            });
        }
    }

    for (&col, allowed) in included.iter().zip(&allow_lists) {
        let Some((label, kinds)) = allowed else {
            continue;
        };
        // First offending row per column is enough.
        let offending = rows.rows.iter().enumerate().find_map(|(row, values)| {
            values
                .get(col)
                .and_then(tck_types::Value::kind)
                .filter(|kind| !kinds.contains(kind))
                .map(|kind| (row, kind))
        });
        if let Some((row, actual)) = offending {
            mismatches.push(Mismatch::ValueType {
                column: rows.columns[col].name.clone(),
                row,
                expected: label,
                actual,
            });
        }
    }
    Ok(mismatches)
}

#[cfg(test)]
mod tests {
    use tck_types::{Cell, CellSet, CellSetAxis, ColumnMeta, Position, Value};

    use super::*;

    fn sales() -> RowSet {
        RowSet::new(vec![
            ColumnMeta::new("STORE_NAME", SqlType::VarChar),
            ColumnMeta::new("unit_sales", SqlType::BigInt),
        ])
        .with_row([Value::text("Store 6"), Value::BigInt(21_333)])
        .with_row([Value::text("Store 7"), Value::BigInt(25_663)])
        .with_row([Value::text("Store 24"), Value::Null])
    }

    fn run(e: &Expectation, rows: &RowSet) -> Vec<String> {
        compare(e, &QueryOutput::Rows(rows.clone()), &[], "\"", ComplianceLevel::Types)
            .expect("valid expectation")
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn exact_rows_pass() {
        let e = Expectation::sql("q")
            .columns(["store_name", "unit_sales"])
            .rows(["Store 6|21,333", "Store 7|25,663", "Store 24|null"])
            .types([SqlType::VarChar, SqlType::BigInt])
            .build();
        assert!(run(&e, &sales()).is_empty());
    }

    #[test]
    fn non_partial_extra_row_fails() {
        let e = Expectation::sql("q").rows(["Store 6|21,333", "Store 7|25,663"]).build();
        let m = run(&e, &sales());
        assert_eq!(m.len(), 1, "{m:?}");
        assert!(m[0].starts_with("too many rows"), "{m:?}");
    }

    #[test]
    fn partial_rows_are_a_prefix() {
        let e = Expectation::sql("q").rows(["Store 6|21,333"]).partial().build();
        assert!(run(&e, &sales()).is_empty());

        let e = Expectation::sql("q").rows(["Store 7|25,663"]).partial().build();
        let m = run(&e, &sales());
        assert_eq!(m.len(), 1);
        assert!(m[0].contains("row 0"), "{m:?}");
    }

    #[test]
    fn too_few_rows_even_when_partial() {
        let e = Expectation::sql("q")
            .rows(["Store 6|21,333", "Store 7|25,663", "Store 24|null", "Store 25|1"])
            .partial()
            .build();
        let m = run(&e, &sales());
        assert_eq!(m, vec!["too few rows: expected 4, result ended after 3".to_owned()]);
    }

    #[test]
    fn every_row_mismatch_is_collected() {
        let e = Expectation::sql("q").rows(["a", "b", "c"]).build();
        assert_eq!(run(&e, &sales()).len(), 3);
    }

    #[test]
    fn column_sequence_and_partial_columns() {
        let e = Expectation::sql("q").columns(["unit_sales", "store_name"]).build();
        let m = run(&e, &sales());
        assert_eq!(m.len(), 1);
        assert!(m[0].contains("column names do not correspond"), "{m:?}");

        let e = Expectation::sql("q").columns(["Unit_Sales", "region"]).columns_partial().build();
        let m = run(&e, &sales());
        assert_eq!(m.len(), 1);
        assert!(m[0].contains("column 'region'"), "{m:?}");
    }

    #[test]
    fn partial_columns_restrict_row_rendering() {
        let e = Expectation::sql("q")
            .columns(["unit_sales"])
            .columns_partial()
            .rows(["21,333", "25,663", "null"])
            .types([SqlType::BigInt])
            .build();
        assert!(run(&e, &sales()).is_empty());
    }

    #[test]
    fn type_checks() {
        let rows = RowSet::new(vec![
            ColumnMeta::new("a", SqlType::Integer),
            ColumnMeta::new("b", SqlType::Decimal),
        ])
        .with_row([Value::Integer(1), Value::Double(1.5)])
        .with_row([Value::Null, Value::text("x")]);
        let e = Expectation::sql("q").types([SqlType::BigInt, SqlType::Decimal]).build();
        let m = run(&e, &rows);
        assert_eq!(m.len(), 3, "{m:?}");
        assert!(m[0].contains("wrong meta type for column a"), "{m:?}");
        assert!(
            m[1].contains("column a in row 0: expected Long, value class was Integer"),
            "{m:?}"
        );
        assert!(m[2].contains("column b in row 1: expected Double / BigDecimal"), "{m:?}");
    }

    #[test]
    fn other_type_skips_checks() {
        let e = Expectation::sql("q").types([SqlType::Other, SqlType::Other]).build();
        assert!(run(&e, &sales()).is_empty());
    }

    #[test]
    fn unsupported_type_is_configuration_error() {
        let e = Expectation::sql("q").types([SqlType::Date, SqlType::BigInt]).build();
        let err = compare(&e, &QueryOutput::Rows(sales()), &[], "\"", ComplianceLevel::Types)
            .expect_err("DATE has no allow-list");
        assert!(err.is_fatal());
    }

    #[test]
    fn levels_gate_dimensions() {
        let e = Expectation::sql("q")
            .columns(["nope"])
            .rows(["nope"])
            .types([SqlType::Date])
            .sql("from sales")
            .build();
        let out = QueryOutput::Rows(sales());
        let m = compare(&e, &out, &[], "\"", ComplianceLevel::Execution).expect("level 1");
        assert_eq!(m.len(), 1);
        assert!(matches!(m[0], Mismatch::MissingSql { .. }));
        let m = compare(&e, &out, &[], "\"", ComplianceLevel::Content).expect("level 2");
        assert_eq!(m.len(), 4, "{m:?}");
    }

    #[test]
    fn cell_set_text_and_sql() {
        let cs = CellSet {
            filter_axis: CellSetAxis::new(vec![Position::default()]),
            axes: vec![CellSetAxis::new(vec![Position::new(["[Measures].[Unit Sales]"])])],
            cells: vec![Cell::new(266_773_i64)],
        };
        let e = Expectation::builder()
            .query("select {[Measures].[Unit Sales]} on 0 from [Sales]")
            .result("Axis #0:\r\n{}\r\nAxis #1:\r\n{[Measures].[Unit Sales]}\r\nRow #0: 266,773\r\n")
            .sql("select sum(\"sales_fact_1997\".\"unit_sales\") as \"m0\"\nfrom \"sales_fact_1997\"")
            .build();
        let captured = vec![
            "SELECT SUM(sales_fact_1997.unit_sales) AS m0\r\nFROM sales_fact_1997 sales_fact_1997"
                .to_owned(),
        ];
        let out = QueryOutput::CellSet(cs);
        let m = compare(&e, &out, &captured, "\"", ComplianceLevel::Types).expect("compare");
        assert!(m.is_empty(), "{m:?}");

        let m = compare(&e, &out, &[], "\"", ComplianceLevel::Types).expect("compare");
        assert_eq!(m.len(), 1);
        assert!(m[0].to_string().starts_with("expected sql was not executed"));
    }

    #[test]
    fn wrong_output_kind() {
        let e = Expectation::sql("q").build();
        let m = compare(
            &e,
            &QueryOutput::CellSet(CellSet::default()),
            &[],
            "\"",
            ComplianceLevel::Types,
        )
        .expect("compare");
        assert_eq!(
            m,
            vec![Mismatch::UnexpectedOutput {
                expected: "result set",
                actual: "cell set"
            }]
        );
    }

    #[test]
    fn assert_passed_converts_mismatches() {
        let result = ComparisonResult {
            query: "q".to_owned(),
            mismatches: vec![Mismatch::TooManyRows { expected: 1 }],
            captured_sql: Vec::new(),
            cancelled: false,
        };
        let err = result.assert_passed().expect_err("mismatch");
        assert!(matches!(err, TckError::AssertionMismatch { .. }));
    }

    #[test]
    fn compliance_level_from_u8() {
        assert_eq!(ComplianceLevel::try_from(2).ok(), Some(ComplianceLevel::Content));
        assert!(ComplianceLevel::try_from(0).is_err());
        assert!(ComplianceLevel::Execution < ComplianceLevel::Types);
    }
}
