//! String rendering of result rows and cell sets for comparison.
//!
//! Numbers are formatted like the `#,##0.###` decimal pattern in an English
//! locale: grouped thousands, at most three fraction digits rounded
//! half-to-even, no trailing zeros.

use std::fmt::Write as _;

use num_format::{Locale, ToFormattedString};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use tck_types::{Cell, CellSet, ColumnMeta, SqlType, Value};

/// Maximum fraction digits kept by the number formatter.
pub const MAX_FRACTION_DIGITS: u32 = 3;

/// Column separator in rendered rows.
pub const ROW_SEPARATOR: &str = "|";

// ─── Numbers ────────────────────────────────────────────────────────────

/// Format a numeric value with grouping; `None` for non-numeric values.
pub fn format_number(value: &Value) -> Option<String> {
    match value {
        Value::TinyInt(v) => Some(v.to_formatted_string(&Locale::en)),
        Value::SmallInt(v) => Some(v.to_formatted_string(&Locale::en)),
        Value::Integer(v) => Some(v.to_formatted_string(&Locale::en)),
        Value::BigInt(v) => Some(v.to_formatted_string(&Locale::en)),
        Value::Double(v) => Some(format_f64(*v)),
        Value::Decimal(d) => Some(format_decimal(*d)),
        _ => None,
    }
}

fn format_f64(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_owned();
    }
    if v.is_infinite() {
        return if v.is_sign_negative() { "-∞" } else { "∞" }.to_owned();
    }
    match Decimal::from_f64(v) {
        Some(d) => format_decimal(d),
        // Beyond the decimal range there are no fraction digits left to show.
        None => {
            let digits = format!("{:.0}", v.abs());
            let sign = if v.is_sign_negative() { "-" } else { "" };
            format!("{sign}{}", group_digits(&digits))
        }
    }
}

fn format_decimal(d: Decimal) -> String {
    let rounded = d
        .round_dp_with_strategy(MAX_FRACTION_DIGITS, RoundingStrategy::MidpointNearestEven)
        .normalize();
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let magnitude = rounded.abs();

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    match magnitude.trunc().to_i128() {
        Some(int_part) => out.push_str(&int_part.to_formatted_string(&Locale::en)),
        None => out.push_str(&group_digits(&magnitude.trunc().to_string())),
    }
    let fract = magnitude.fract();
    if !fract.is_zero() {
        let text = fract.to_string();
        // "0.125" -> ".125"
        if let Some(digits) = text.strip_prefix('0') {
            out.push_str(digits);
        }
    }
    out
}

fn group_digits(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

// ─── Tabular rows ───────────────────────────────────────────────────────

/// Render one value for a column of the given type.
///
/// `NULL` renders as `null`; numeric column types go through
/// [`format_number`]; everything else uses the value's default string form.
pub fn render_value(value: &Value, sql_type: SqlType) -> String {
    if value.is_null() {
        return "null".to_owned();
    }
    if sql_type.is_formatted_numeric() {
        if let Some(s) = format_number(value) {
            return s;
        }
    }
    value.to_string()
}

/// Render a row pipe-delimited, keeping only the columns whose index passes
/// `include`.
pub fn render_row<F>(row: &[Value], columns: &[ColumnMeta], include: F) -> String
where
    F: Fn(usize) -> bool,
{
    row.iter()
        .zip(columns)
        .enumerate()
        .filter(|(i, _)| include(*i))
        .map(|(_, (value, column))| render_value(value, column.sql_type))
        .collect::<Vec<_>>()
        .join(ROW_SEPARATOR)
}

// ─── Cell sets ──────────────────────────────────────────────────────────

/// The formatted value of a cell: the driver's own text when supplied,
/// otherwise the number formatter, otherwise the default string form.
/// Empty cells render as an empty string.
pub fn render_cell(cell: &Cell) -> String {
    if let Some(formatted) = &cell.formatted {
        return formatted.clone();
    }
    if cell.value.is_null() {
        return String::new();
    }
    format_number(&cell.value).unwrap_or_else(|| cell.value.to_string())
}

/// Render a cell set in the traditional axis/row report format:
///
/// ```text
/// Axis #0:
/// {[customer].[500]}
/// Axis #1:
/// {[Measures].[Unit Sales]}
/// Row #0: 10
/// ```
///
/// A cell set with no axes prints its single cell value without a trailing
/// newline.
pub fn cell_set_to_string(cell_set: &CellSet) -> String {
    let mut out = String::from("Axis #0:\n");
    write_axis(&mut out, &cell_set.filter_axis.positions);
    for (i, axis) in cell_set.axes.iter().enumerate() {
        let _ = writeln!(out, "Axis #{}:", i + 1);
        write_axis(&mut out, &axis.positions);
    }
    if cell_set.axes.is_empty() {
        if let Some(cell) = cell_set.cell(&[]) {
            out.push_str(&render_cell(cell));
        }
    } else {
        let mut coords = vec![0; cell_set.axes.len()];
        write_rows(&mut out, cell_set, cell_set.axes.len() - 1, &mut coords);
    }
    out
}

fn write_axis(out: &mut String, positions: &[tck_types::Position]) {
    for position in positions {
        let _ = writeln!(out, "{{{}}}", position.members.join(", "));
    }
}

fn write_rows(out: &mut String, cell_set: &CellSet, axis: usize, coords: &mut [usize]) {
    for i in 0..cell_set.axes[axis].len() {
        coords[axis] = i;
        if axis == 0 {
            let row = coords.get(1).copied().unwrap_or(0);
            let text = cell_set.cell(coords).map(render_cell).unwrap_or_default();
            let _ = writeln!(out, "Row #{row}: {text}");
        } else {
            write_rows(out, cell_set, axis - 1, coords);
        }
    }
}
