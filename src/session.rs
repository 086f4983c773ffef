//! Unit of work and security context
//!
//! A [`UnitOfWork`] owns one connection for the lifetime of a request. Transactions begin
//! lazily on the first statement; right after `BEGIN` the request's [`SecurityContext`] is
//! applied with `set_config('request.jwt.claims', ...)`, `SET LOCAL statement_timeout` and
//! `SET LOCAL ROLE`, so row-level security sees the caller on every statement. After
//! `commit`/`rollback` the next statement opens a fresh transaction with the same context.
//!
//! Work fanned out to other coroutines gets its own connection through
//! [`UnitOfWork::spawn_child`], which carries the parent's context explicitly, or runs there
//! directly with [`UnitOfWork::fork`].

use may_postgres::Client;
use sea_query::{Value, Values};
use serde_json::Value as JsonValue;
use std::cell::Cell;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

use crate::config::DatabaseSettings;
use crate::connection::{connect_with, ConnectionError};
use crate::error::DbError;
use crate::executor::{execute_on, query_on, Executor, Row};

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn to_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Who the current request acts as
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityContext {
    /// JWT claims forwarded to `request.jwt.claims`
    pub claims: JsonValue,
    pub user_id: Option<String>,
    pub authenticated: bool,
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl SecurityContext {
    pub fn anonymous() -> Self {
        Self {
            claims: JsonValue::Object(Default::default()),
            user_id: None,
            authenticated: false,
        }
    }

    pub fn authenticated(user_id: impl Into<String>, claims: JsonValue) -> Self {
        Self {
            claims,
            user_id: Some(user_id.into()),
            authenticated: true,
        }
    }

    /// Database role selected for this context
    pub fn role<'a>(&self, settings: &'a DatabaseSettings) -> &'a str {
        if settings.enable_access_control && self.authenticated {
            &settings.auth_role
        } else {
            &settings.admin_role
        }
    }

    /// Statements run right after `BEGIN`
    pub fn setup_statements(&self, settings: &DatabaseSettings) -> Vec<(String, Values)> {
        vec![
            (
                "SELECT set_config('request.jwt.claims', $1, true)".to_string(),
                Values(vec![Value::from(self.claims.to_string())]),
            ),
            (
                format!(
                    "SET LOCAL statement_timeout = {}",
                    settings.statement_timeout_ms
                ),
                Values(Vec::new()),
            ),
            (
                format!("SET LOCAL ROLE {}", quote_ident(self.role(settings))),
                Values(Vec::new()),
            ),
        ]
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// An [`Executor`] with transaction control
pub trait Session: Executor {
    fn commit(&self) -> Result<(), DbError>;
    fn rollback(&self) -> Result<(), DbError>;
}

/// Request-scoped connection, transaction and security context
///
/// Not `Sync`: a unit of work belongs to one coroutine. Dropping it with a transaction still
/// open rolls the transaction back.
pub struct UnitOfWork {
    client: Client,
    context: SecurityContext,
    settings: DatabaseSettings,
    isolation: IsolationLevel,
    in_transaction: Cell<bool>,
    closed: Cell<bool>,
}

impl UnitOfWork {
    pub fn new(client: Client, context: SecurityContext, settings: DatabaseSettings) -> Self {
        Self {
            client,
            context,
            settings,
            isolation: IsolationLevel::default(),
            in_transaction: Cell::new(false),
            closed: Cell::new(false),
        }
    }

    /// Connect with `settings` and scope the connection to `context`
    pub fn open(settings: &DatabaseSettings, context: SecurityContext) -> Result<Self, ConnectionError> {
        let client = connect_with(settings)?;
        Ok(Self::new(client, context, settings.clone()))
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn context(&self) -> &SecurityContext {
        &self.context
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.get()
    }

    /// A new unit of work on `client` that inherits this one's security context
    pub fn spawn_child(&self, client: Client) -> UnitOfWork {
        UnitOfWork::new(client, self.context.clone(), self.settings.clone())
            .with_isolation(self.isolation)
    }

    /// Open a child unit of work on a fresh connection
    pub fn open_child(&self) -> Result<UnitOfWork, ConnectionError> {
        let client = connect_with(&self.settings)?;
        Ok(self.spawn_child(client))
    }

    /// Run `work` on a `may` coroutine with a child unit of work
    ///
    /// The child opens its own connection with this unit's security context and isolation
    /// level. It commits when `work` returns `Ok` and rolls back otherwise. Blocks until the
    /// coroutine finishes; a panic inside `work` is resumed on the caller.
    pub fn fork<F, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&UnitOfWork) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        let settings = self.settings.clone();
        let context = self.context.clone();
        let isolation = self.isolation;
        let handle = may::go!(move || -> Result<T, E> {
            let child = UnitOfWork::open(&settings, context)
                .map_err(|err| E::from(DbError::from(err)))?
                .with_isolation(isolation);
            match work(&child) {
                Ok(out) => {
                    child.commit().map_err(E::from)?;
                    Ok(out)
                }
                Err(err) => {
                    if let Err(rollback) = child.rollback() {
                        log::warn!("rollback of forked unit of work failed: {rollback}");
                    }
                    Err(err)
                }
            }
        });
        match handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn ensure_begun(&self) -> Result<(), DbError> {
        if self.closed.get() {
            return Err(DbError::TransactionClosed);
        }
        if self.in_transaction.get() {
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        let begin = format!("BEGIN ISOLATION LEVEL {}", self.isolation.to_sql());
        execute_on(&self.client, &begin, &Values(Vec::new()))?;
        self.in_transaction.set(true);

        for (sql, values) in self.context.setup_statements(&self.settings) {
            if let Err(err) = query_on(&self.client, &sql, &values) {
                log::warn!("failed to apply security context, rolling back: {err}");
                self.finish("ROLLBACK", "rollback")?;
                return Err(err);
            }
        }
        Ok(())
    }

    fn finish(&self, statement: &str, outcome: &'static str) -> Result<(), DbError> {
        self.in_transaction.set(false);
        let result = execute_on(&self.client, statement, &Values(Vec::new())).map(|_| ());
        #[cfg(feature = "metrics")]
        METRICS.record_transaction(outcome);
        #[cfg(not(feature = "metrics"))]
        let _ = outcome;
        result
    }

    /// Roll back anything pending and release the unit of work
    pub fn close(self) -> Result<(), DbError> {
        let result = if self.in_transaction.get() {
            self.finish("ROLLBACK", "rollback")
        } else {
            Ok(())
        };
        self.closed.set(true);
        result
    }
}

impl Executor for UnitOfWork {
    fn execute(&self, sql: &str, values: &Values) -> Result<u64, DbError> {
        self.ensure_begun()?;
        execute_on(&self.client, sql, values)
    }

    fn query(&self, sql: &str, values: &Values) -> Result<Vec<Row>, DbError> {
        self.ensure_begun()?;
        query_on(&self.client, sql, values)
    }
}

impl Session for UnitOfWork {
    fn commit(&self) -> Result<(), DbError> {
        if self.closed.get() {
            return Err(DbError::TransactionClosed);
        }
        if !self.in_transaction.get() {
            return Ok(());
        }
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();
        self.finish("COMMIT", "commit")
    }

    fn rollback(&self) -> Result<(), DbError> {
        if self.closed.get() {
            return Err(DbError::TransactionClosed);
        }
        if !self.in_transaction.get() {
            return Ok(());
        }
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();
        self.finish("ROLLBACK", "rollback")
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.in_transaction.get() && !self.closed.get() {
            if let Err(err) = self.finish("ROLLBACK", "rollback") {
                log::warn!("rollback on drop failed: {err}");
            }
        }
    }
}
