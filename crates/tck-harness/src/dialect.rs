//! SQL dialect contract used to build fixture queries and to normalize
//! captured SQL.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use tck_error::{Result, TckError};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Dialect-specific quoting and ordering rules.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Short dialect name used in logs.
    fn name(&self) -> &str;

    /// The string wrapped around identifiers (`"` for ANSI, `` ` `` for MySQL).
    fn quote_identifier_string(&self) -> &str;

    /// Whether `ORDER BY` must reference the select-list alias rather than the
    /// expression.
    fn requires_order_by_alias(&self) -> bool {
        false
    }

    /// Quote a possibly dotted identifier; each segment is quoted separately
    /// and embedded quote characters are doubled.
    fn quote_identifier(&self, ident: &str) -> String {
        let q = self.quote_identifier_string();
        if q.is_empty() {
            return ident.to_owned();
        }
        let doubled = format!("{q}{q}");
        ident
            .split('.')
            .map(|part| {
                if part.starts_with(q) && part.ends_with(q) && part.len() >= 2 * q.len() {
                    part.to_owned()
                } else {
                    format!("{q}{}{q}", part.replace(q, &doubled))
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// One `ORDER BY` item with the requested null collation.
    fn generate_order_item(
        &self,
        expr: &str,
        nullable: bool,
        ascending: bool,
        collate_nulls_last: bool,
    ) -> String {
        let direction = if ascending { "ASC" } else { "DESC" };
        if !nullable {
            return format!("{expr} {direction}");
        }
        let (null_rank, other_rank) = if collate_nulls_last { (1, 0) } else { (0, 1) };
        format!(
            "CASE WHEN {expr} IS NULL THEN {null_rank} ELSE {other_rank} END, {expr} {direction}"
        )
    }

    fn quote_string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// `DATE 'yyyy-mm-dd'`; rejects anything else, including impossible
    /// calendar dates.
    fn quote_date_literal(&self, value: &str) -> Result<String> {
        NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|e| {
            TckError::configuration(format!("illegal DATE literal '{value}': {e}"))
        })?;
        Ok(format!("DATE '{value}'"))
    }

    /// `TIMESTAMP 'yyyy-mm-dd hh:mm:ss[.f]'`; rejects anything else.
    fn quote_timestamp_literal(&self, value: &str) -> Result<String> {
        NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).map_err(|e| {
            TckError::configuration(format!("illegal TIMESTAMP literal '{value}': {e}"))
        })?;
        Ok(format!("TIMESTAMP '{value}'"))
    }
}

// ─── Implementations ────────────────────────────────────────────────────

/// Standard SQL: double-quoted identifiers, `CASE`-based null ordering.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsiDialect;

impl Dialect for AnsiDialect {
    fn name(&self) -> &str {
        "ansi"
    }

    fn quote_identifier_string(&self) -> &str {
        "\""
    }
}

/// MySQL: backtick identifiers, `ISNULL()` null ordering, backslash escapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn quote_identifier_string(&self) -> &str {
        "`"
    }

    fn requires_order_by_alias(&self) -> bool {
        true
    }

    fn generate_order_item(
        &self,
        expr: &str,
        nullable: bool,
        ascending: bool,
        collate_nulls_last: bool,
    ) -> String {
        let direction = if ascending { "ASC" } else { "DESC" };
        // MySQL already sorts NULL first ascending and last descending.
        if !nullable || collate_nulls_last != ascending {
            return format!("{expr} {direction}");
        }
        let null_direction = if collate_nulls_last { "ASC" } else { "DESC" };
        format!("ISNULL({expr}) {null_direction}, {expr} {direction}")
    }

    fn quote_string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }
}

// ─── Fixture helpers ────────────────────────────────────────────────────

/// `select <col> from <table> order by <order_expr>` with quoted identifiers.
pub fn select_query(dialect: &dyn Dialect, column: &str, table: &str, order_expr: &str) -> String {
    format!(
        "select {} from {} order by {order_expr}",
        dialect.quote_identifier(column),
        dialect.quote_identifier(table)
    )
}

/// Order item over `alias` or `expr`, whichever the dialect requires.
pub fn order_expression(
    dialect: &dyn Dialect,
    alias: &str,
    expr: &str,
    nullable: bool,
    ascending: bool,
    collate_nulls_last: bool,
) -> String {
    let target = if dialect.requires_order_by_alias() {
        dialect.quote_identifier(alias)
    } else {
        dialect.quote_identifier(expr)
    };
    dialect.generate_order_item(&target, nullable, ascending, collate_nulls_last)
}
