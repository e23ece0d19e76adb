use serde::{Deserialize, Serialize};

use crate::sql_type::SqlType;
use crate::value::Value;

/// Name and driver-reported type of one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub sql_type: SqlType,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }
}

/// A fully materialized tabular result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    #[must_use]
    pub fn new(columns: Vec<ColumnMeta>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row; missing trailing cells are filled with `NULL` and extra
    /// cells are dropped so every row matches the column count.
    #[must_use]
    pub fn with_row(mut self, row: impl IntoIterator<Item = Value>) -> Self {
        self.push_row(row);
        self
    }

    pub fn push_row(&mut self, row: impl IntoIterator<Item = Value>) {
        let width = self.columns.len();
        let mut cells: Vec<Value> = row.into_iter().take(width).collect();
        cells.resize(width, Value::Null);
        self.rows.push(cells);
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Keep only the first `max` rows.
    pub fn truncate(&mut self, max: usize) {
        self.rows.truncate(max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_columns() -> RowSet {
        RowSet::new(vec![
            ColumnMeta::new("store", SqlType::VarChar),
            ColumnMeta::new("sales", SqlType::BigInt),
        ])
    }

    #[test]
    fn rows_are_padded_and_clipped_to_width() {
        let rs = two_columns()
            .with_row([Value::from("CA")])
            .with_row([Value::from("OR"), Value::from(7_i64), Value::from(9_i64)]);
        assert_eq!(rs.rows[0], vec![Value::from("CA"), Value::Null]);
        assert_eq!(rs.rows[1], vec![Value::from("OR"), Value::BigInt(7)]);
        assert_eq!(rs.row_count(), 2);
    }

    #[test]
    fn column_names_in_order() {
        assert_eq!(two_columns().column_names(), vec!["store", "sales"]);
    }

    #[test]
    fn serializes_with_type_names() {
        let rs = two_columns().with_row([Value::from("CA"), Value::from(1_i64)]);
        let json = serde_json::to_string(&rs).expect("serialize");
        assert!(json.contains("\"VAR_CHAR\""), "{json}");
        let back: RowSet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, rs);
    }
}
