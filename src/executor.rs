//! Executor seam
//!
//! [`Executor`] is the narrow interface every query in the crate goes through: SQL text plus
//! `sea_query::Values` in, decoded [`Row`]s out. Working with decoded rows (rather than driver
//! rows) keeps the query-building layers testable with a scripted session.
//!
//! [`PgExecutor`] runs statements directly on a `may_postgres::Client` in autocommit mode; it is
//! used for schema setup and tooling. Repository work goes through
//! [`crate::session::UnitOfWork`], which wraps the same machinery in a transaction.

use may_postgres::Client;
use sea_query::{Value, Values};
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

use crate::error::DbError;
use crate::value::{decode_pg_row, to_sql_params};

/// A decoded result row: column labels with their values, in select-list order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Build a row from `(label, value)` pairs
    pub fn from_pairs<I, S, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<Value>,
    {
        let (columns, values) = pairs
            .into_iter()
            .map(|(label, value)| (label.into(), value.into()))
            .unzip();
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a select-list position
    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value by column label
    pub fn get(&self, label: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == label)
            .and_then(|idx| self.values.get(idx))
    }
}

/// Trait for executing statements
///
/// Implementations: [`PgExecutor`] (autocommit), [`crate::session::UnitOfWork`] (transactional)
/// and the scripted `MockSession` used in tests.
pub trait Executor {
    /// Execute a statement and return the number of rows affected
    fn execute(&self, sql: &str, values: &Values) -> Result<u64, DbError>;

    /// Execute a query and return all rows
    fn query(&self, sql: &str, values: &Values) -> Result<Vec<Row>, DbError>;

    /// Execute a query and return its first row, if any
    fn query_one(&self, sql: &str, values: &Values) -> Result<Option<Row>, DbError> {
        Ok(self.query(sql, values)?.into_iter().next())
    }
}

/// Run a statement on `client`, recording metrics and spans
pub(crate) fn execute_on(client: &Client, sql: &str, values: &Values) -> Result<u64, DbError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::execute_query_span(sql).entered();

    log::debug!("execute: {sql}");
    let params = to_sql_params(values)?;
    let refs: Vec<&dyn may_postgres::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let start = Instant::now();
    let result = client.execute(sql, &refs).map_err(|e| {
        #[cfg(feature = "metrics")]
        METRICS.record_query_error();
        DbError::from(e)
    });

    #[cfg(feature = "metrics")]
    METRICS.record_query_duration(start.elapsed());
    #[cfg(not(feature = "metrics"))]
    let _ = start;

    result
}

/// Run a query on `client` and decode its rows
pub(crate) fn query_on(client: &Client, sql: &str, values: &Values) -> Result<Vec<Row>, DbError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::execute_query_span(sql).entered();

    log::debug!("query: {sql}");
    let params = to_sql_params(values)?;
    let refs: Vec<&dyn may_postgres::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let start = Instant::now();
    let result = client.query(sql, &refs).map_err(|e| {
        #[cfg(feature = "metrics")]
        METRICS.record_query_error();
        DbError::from(e)
    });

    #[cfg(feature = "metrics")]
    METRICS.record_query_duration(start.elapsed());
    #[cfg(not(feature = "metrics"))]
    let _ = start;

    result?.iter().map(decode_pg_row).collect()
}

/// Executor over a `may_postgres::Client` in autocommit mode
pub struct PgExecutor {
    client: Client,
}

impl PgExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn into_client(self) -> Client {
        self.client
    }

    /// Run several `;`-separated statements without parameters
    pub fn batch_execute(&self, sql: &str) -> Result<(), DbError> {
        log::debug!("batch: {sql}");
        self.client.batch_execute(sql).map_err(DbError::from)
    }
}

impl Executor for PgExecutor {
    fn execute(&self, sql: &str, values: &Values) -> Result<u64, DbError> {
        execute_on(&self.client, sql, values)
    }

    fn query(&self, sql: &str, values: &Values) -> Result<Vec<Row>, DbError> {
        query_on(&self.client, sql, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup_by_label_and_index() {
        let row = Row::from_pairs([("id", Value::from(1i32)), ("name", Value::from("Ann"))]);
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("name"), Some(&Value::from("Ann")));
        assert_eq!(row.value(0), Some(&Value::from(1i32)));
        assert!(row.get("missing").is_none());
        assert_eq!(row.columns(), &["id".to_string(), "name".to_string()]);
    }

    #[test]
    fn test_query_one_default_takes_first_row() {
        struct TwoRows;
        impl Executor for TwoRows {
            fn execute(&self, _sql: &str, _values: &Values) -> Result<u64, DbError> {
                Ok(0)
            }
            fn query(&self, _sql: &str, _values: &Values) -> Result<Vec<Row>, DbError> {
                Ok(vec![
                    Row::from_pairs([("n", 1i32)]),
                    Row::from_pairs([("n", 2i32)]),
                ])
            }
        }
        let first = TwoRows
            .query_one("SELECT n", &Values(vec![]))
            .expect("query ok")
            .expect("row present");
        assert_eq!(first.get("n"), Some(&Value::from(1i32)));
    }
}
