//! Immutable description of one query and what it must produce.
//!
//! Every dimension is optional; an absent field means "do not check".

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tck_error::DriverResult;
use tck_types::SqlType;

use crate::capture::SqlCapture;
use crate::driver::{QueryOutput, Statement};

/// Callback that produces a result from a statement instead of a query text.
pub type QueryProvider =
    Arc<dyn Fn(&mut dyn Statement, &SqlCapture) -> DriverResult<QueryOutput> + Send + Sync>;

/// Adjustment applied to a statement before it executes.
pub type StatementModifier = Arc<dyn Fn(&mut dyn Statement) -> DriverResult<()> + Send + Sync>;

/// Where the query comes from.
#[derive(Clone)]
pub enum QuerySource {
    Text(String),
    Provider { label: String, produce: QueryProvider },
}

impl QuerySource {
    /// Query text, or the provider label, for messages.
    pub fn describe(&self) -> &str {
        match self {
            Self::Text(q) => q,
            Self::Provider { label, .. } => label,
        }
    }
}

impl fmt::Debug for QuerySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(q) => f.debug_tuple("Text").field(q).finish(),
            Self::Provider { label, .. } => f.debug_tuple("Provider").field(label).finish(),
        }
    }
}

/// A query plus its expected columns, types, rows, backing SQL and
/// cell-set text.
///
/// Construct with [`Expectation::builder`]. `expect_result_set` selects the
/// tabular path (columns/types/rows) over the multidimensional path
/// (cell-set text); SQL fragments are checked on both.
#[derive(Clone)]
pub struct Expectation {
    query: QuerySource,
    columns: Option<Vec<String>>,
    columns_partial: bool,
    types: Option<Vec<SqlType>>,
    rows: Option<Vec<String>>,
    partial: bool,
    sql_fragments: Vec<String>,
    cell_set_text: Option<String>,
    cancel_timeout: Option<Duration>,
    fresh_cache: bool,
    expect_result_set: bool,
    modifiers: Vec<StatementModifier>,
}

impl Expectation {
    /// Start a builder for the multidimensional path.
    pub fn builder() -> ExpectationBuilder {
        ExpectationBuilder::default()
    }

    /// Start a builder for a tabular query (`expect_result_set` already set).
    pub fn sql(query: impl Into<String>) -> ExpectationBuilder {
        Self::builder().query(query).expect_result_set(true)
    }

    pub fn query(&self) -> &QuerySource {
        &self.query
    }

    pub fn describe_query(&self) -> &str {
        self.query.describe()
    }

    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    pub fn columns_partial(&self) -> bool {
        self.columns_partial
    }

    pub fn types(&self) -> Option<&[SqlType]> {
        self.types.as_deref()
    }

    pub fn rows(&self) -> Option<&[String]> {
        self.rows.as_deref()
    }

    pub fn partial(&self) -> bool {
        self.partial
    }

    pub fn sql_fragments(&self) -> &[String] {
        &self.sql_fragments
    }

    pub fn cell_set_text(&self) -> Option<&str> {
        self.cell_set_text.as_deref()
    }

    pub fn cancel_timeout(&self) -> Option<Duration> {
        self.cancel_timeout
    }

    pub fn fresh_cache(&self) -> bool {
        self.fresh_cache
    }

    pub fn expect_result_set(&self) -> bool {
        self.expect_result_set
    }

    pub fn modifiers(&self) -> &[StatementModifier] {
        &self.modifiers
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("query", &self.query)
            .field("columns", &self.columns)
            .field("columns_partial", &self.columns_partial)
            .field("types", &self.types)
            .field("rows", &self.rows)
            .field("partial", &self.partial)
            .field("sql_fragments", &self.sql_fragments)
            .field("cell_set_text", &self.cell_set_text)
            .field("cancel_timeout", &self.cancel_timeout)
            .field("fresh_cache", &self.fresh_cache)
            .field("expect_result_set", &self.expect_result_set)
            .field("modifiers", &self.modifiers.len())
            .finish()
    }
}

/// Fluent builder for [`Expectation`]; fields may be set in any order.
#[derive(Default)]
pub struct ExpectationBuilder {
    query: Option<QuerySource>,
    columns: Option<Vec<String>>,
    columns_partial: bool,
    types: Option<Vec<SqlType>>,
    rows: Option<Vec<String>>,
    partial: bool,
    sql_fragments: Vec<String>,
    cell_set_text: Option<String>,
    cancel_timeout: Option<Duration>,
    fresh_cache: bool,
    expect_result_set: bool,
    modifiers: Vec<StatementModifier>,
}

impl ExpectationBuilder {
    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(QuerySource::Text(query.into()));
        self
    }

    /// Produce the result through a callback; `label` names it in messages.
    #[must_use]
    pub fn provider<F>(mut self, label: impl Into<String>, produce: F) -> Self
    where
        F: Fn(&mut dyn Statement, &SqlCapture) -> DriverResult<QueryOutput> + Send + Sync + 'static,
    {
        self.query = Some(QuerySource::Provider {
            label: label.into(),
            produce: Arc::new(produce),
        });
        self
    }

    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// The declared columns are a subset of the actual ones.
    #[must_use]
    pub fn columns_partial(mut self) -> Self {
        self.columns_partial = true;
        self
    }

    #[must_use]
    pub fn types(mut self, types: impl IntoIterator<Item = SqlType>) -> Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    /// Expected rows, values delimited by `|`.
    #[must_use]
    pub fn rows<I, S>(mut self, rows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows = Some(rows.into_iter().map(Into::into).collect());
        self
    }

    /// The declared rows are only a prefix of the result.
    #[must_use]
    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    /// A SQL fragment that must appear in some executed statement.
    #[must_use]
    pub fn sql(mut self, fragment: impl Into<String>) -> Self {
        self.sql_fragments.push(fragment.into());
        self
    }

    /// Expected cell-set text in the traditional report format.
    #[must_use]
    pub fn result(mut self, text: impl Into<String>) -> Self {
        self.cell_set_text = Some(text.into());
        self
    }

    /// Allow the cancellation policy to cancel this query after `timeout`.
    #[must_use]
    pub fn cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn cancel_timeout_millis(self, millis: u64) -> Self {
        self.cancel_timeout(Duration::from_millis(millis))
    }

    #[must_use]
    pub fn with_fresh_cache(mut self) -> Self {
        self.fresh_cache = true;
        self
    }

    #[must_use]
    pub fn expect_result_set(mut self, expect: bool) -> Self {
        self.expect_result_set = expect;
        self
    }

    #[must_use]
    pub fn modifier<F>(mut self, modifier: F) -> Self
    where
        F: Fn(&mut dyn Statement) -> DriverResult<()> + Send + Sync + 'static,
    {
        self.modifiers.push(Arc::new(modifier));
        self
    }

    #[must_use]
    pub fn max_rows(self, max_rows: usize) -> Self {
        self.modifier(move |stmt| stmt.set_max_rows(max_rows))
    }

    /// Finish the expectation. A missing query becomes the empty text query.
    pub fn build(self) -> Expectation {
        Expectation {
            query: self
                .query
                .unwrap_or_else(|| QuerySource::Text(String::new())),
            columns: self.columns,
            columns_partial: self.columns_partial,
            types: self.types,
            rows: self.rows,
            partial: self.partial,
            sql_fragments: self.sql_fragments,
            cell_set_text: self.cell_set_text,
            cancel_timeout: self.cancel_timeout,
            fresh_cache: self.fresh_cache,
            expect_result_set: self.expect_result_set,
            modifiers: self.modifiers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_fields_mean_unchecked() {
        let e = Expectation::builder().query("select 1").build();
        assert_eq!(e.describe_query(), "select 1");
        assert!(e.columns().is_none());
        assert!(e.types().is_none());
        assert!(e.rows().is_none());
        assert!(e.sql_fragments().is_empty());
        assert!(e.cell_set_text().is_none());
        assert!(e.cancel_timeout().is_none());
        assert!(!e.expect_result_set());
        assert!(!e.fresh_cache());
    }

    #[test]
    fn builder_order_does_not_matter() {
        let a = Expectation::sql("select sum(unit_sales) sum_sales from sales_fact_1997")
            .rows(["266,773"])
            .columns(["sum_sales"])
            .types([SqlType::BigInt])
            .build();
        let b = Expectation::builder()
            .types([SqlType::BigInt])
            .columns(["sum_sales"])
            .expect_result_set(true)
            .rows(["266,773"])
            .query("select sum(unit_sales) sum_sales from sales_fact_1997")
            .build();
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }

    #[test]
    fn fragments_and_modifiers_accumulate() {
        let e = Expectation::builder()
            .query("select {[Measures].[Unit Sales]} on 0 from [Sales]")
            .sql("from sales_fact_1997")
            .sql("group by")
            .max_rows(5)
            .cancel_timeout_millis(1000)
            .with_fresh_cache()
            .build();
        assert_eq!(e.sql_fragments(), ["from sales_fact_1997", "group by"]);
        assert_eq!(e.modifiers().len(), 1);
        assert_eq!(e.cancel_timeout(), Some(Duration::from_secs(1)));
        assert!(e.fresh_cache());
    }

    #[test]
    fn provider_label_is_used_in_messages() {
        let e = Expectation::builder()
            .provider("metadata: tables", |_stmt, _capture| {
                Ok(QueryOutput::Rows(tck_types::RowSet::default()))
            })
            .build();
        assert_eq!(e.describe_query(), "metadata: tables");
        assert!(matches!(e.query(), QuerySource::Provider { .. }));
    }
}
