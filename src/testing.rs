//! Test support: a scripted session and a database handle from `TEST_DATABASE_URL`
//!
//! Enabled for this crate's own tests and, for downstream crates, with the `test-helpers`
//! feature.

use sea_query::Values;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::DatabaseSettings;
use crate::connection::{connect, ConnectionError};
use crate::error::DbError;
use crate::executor::{Executor, PgExecutor, Row};
use crate::schema::{DDL, DROP_DDL};
use crate::session::{SecurityContext, Session, UnitOfWork};

/// Scripted outcome of one statement
#[derive(Debug, Clone)]
pub enum Scripted {
    Rows(Vec<Row>),
    Affected(u64),
    Fail(DbError),
}

/// One statement as the session received it
#[derive(Debug, Clone, PartialEq)]
pub struct Captured {
    pub sql: String,
    pub values: Values,
}

/// In-memory [`Session`] that records statements and replays scripted results
///
/// Each `execute`/`query` call consumes the next scripted outcome in order; once the script is
/// exhausted queries return no rows and statements affect no rows.
#[derive(Debug, Clone, Default)]
pub struct MockSession {
    captured: Arc<Mutex<Vec<Captured>>>,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    events: Arc<Mutex<Vec<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: Scripted) -> &Self {
        lock(&self.script).push_back(outcome);
        self
    }

    pub fn push_rows(&self, rows: Vec<Row>) -> &Self {
        self.push(Scripted::Rows(rows))
    }

    pub fn push_affected(&self, count: u64) -> &Self {
        self.push(Scripted::Affected(count))
    }

    pub fn push_error(&self, err: DbError) -> &Self {
        self.push(Scripted::Fail(err))
    }

    pub fn captured(&self) -> Vec<Captured> {
        lock(&self.captured).clone()
    }

    pub fn sql(&self) -> Vec<String> {
        lock(&self.captured).iter().map(|c| c.sql.clone()).collect()
    }

    /// Statements and transaction events (`COMMIT`, `ROLLBACK`) in order
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn commits(&self) -> usize {
        lock(&self.events).iter().filter(|e| *e == "COMMIT").count()
    }

    pub fn rollbacks(&self) -> usize {
        lock(&self.events).iter().filter(|e| *e == "ROLLBACK").count()
    }

    pub fn clear(&self) {
        lock(&self.captured).clear();
        lock(&self.events).clear();
        lock(&self.script).clear();
    }

    fn record(&self, sql: &str, values: &Values) -> Option<Scripted> {
        lock(&self.captured).push(Captured {
            sql: sql.to_string(),
            values: values.clone(),
        });
        lock(&self.events).push(sql.to_string());
        lock(&self.script).pop_front()
    }
}

impl Executor for MockSession {
    fn execute(&self, sql: &str, values: &Values) -> Result<u64, DbError> {
        match self.record(sql, values) {
            Some(Scripted::Affected(count)) => Ok(count),
            Some(Scripted::Rows(rows)) => Ok(rows.len() as u64),
            Some(Scripted::Fail(err)) => Err(err),
            None => Ok(0),
        }
    }

    fn query(&self, sql: &str, values: &Values) -> Result<Vec<Row>, DbError> {
        match self.record(sql, values) {
            Some(Scripted::Rows(rows)) => Ok(rows),
            Some(Scripted::Affected(_)) | None => Ok(Vec::new()),
            Some(Scripted::Fail(err)) => Err(err),
        }
    }
}

impl Session for MockSession {
    fn commit(&self) -> Result<(), DbError> {
        lock(&self.events).push("COMMIT".to_string());
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        lock(&self.events).push("ROLLBACK".to_string());
        Ok(())
    }
}

/// Handle on the database named by `TEST_DATABASE_URL`
pub struct TestDatabase {
    url: String,
}

impl TestDatabase {
    pub const ENV_VAR: &'static str = "TEST_DATABASE_URL";

    /// `None` when `TEST_DATABASE_URL` is unset, so database tests can skip
    pub fn from_env() -> Option<Self> {
        match std::env::var(Self::ENV_VAR) {
            Ok(url) if !url.trim().is_empty() => Some(Self { url }),
            _ => {
                log::info!("{} not set; skipping database test", Self::ENV_VAR);
                None
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn settings(&self) -> DatabaseSettings {
        DatabaseSettings {
            url: self.url.clone(),
            ..DatabaseSettings::default()
        }
    }

    pub fn executor(&self) -> Result<PgExecutor, ConnectionError> {
        Ok(PgExecutor::new(connect(&self.url)?))
    }

    /// Drop and recreate the roster tables
    pub fn reset_schema(&self) -> Result<(), ConnectionError> {
        let executor = self.executor()?;
        executor.batch_execute(DROP_DDL)?;
        executor.batch_execute(DDL)?;
        Ok(())
    }

    pub fn unit_of_work(&self, context: SecurityContext) -> Result<UnitOfWork, ConnectionError> {
        UnitOfWork::open(&self.settings(), context)
    }
}
