//! # Touchline
//!
//! Schema-driven query building and repositories for a team roster backend, on PostgreSQL via
//! `may_postgres`.
//!
//! A read starts from an [`OutputShape`], the shape of the response a caller wants. The shape
//! is reduced to a [`FieldGraph`], planned against a [`ModelDef`] into a [`QueryPlan`], compiled
//! into [`LoadingDirective`]s and executed by the loader. Filters and ordering come from a
//! [`FilterSpec`]; pages from [`PageParams`]. Writes go through the same [`Repository`] and
//! commit or roll back as a unit.

extern crate self as touchline;

pub mod compile;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod filter;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod pagination;
pub mod plan;
pub mod record;
pub mod repository;
pub mod schema;
pub mod session;
pub mod shape;
pub mod sql;
pub mod value;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use compile::{compile, LoadStrategy, LoadingDirective};
pub use config::{DatabaseSettings, QuerySettings, TouchlineConfig, UnknownFieldPolicy};
pub use error::{DbError, FilterError, RepositoryError, SchemaError};
pub use executor::{Executor, PgExecutor, Row};
pub use filter::{FilterEngine, FilterSpec};
pub use loader::LoadPlan;
pub use model::{ColumnDef, ColumnType, ModelDef, RelationDef, RelationKind};
pub use pagination::{Listing, Page, PageParams, PaginationStrategy};
pub use plan::{PlanBuilder, PlanNode, QueryPlan};
pub use record::{Record, Related};
pub use repository::{OnConflict, Repository};
pub use session::{IsolationLevel, SecurityContext, Session, UnitOfWork};
pub use shape::{extract, FieldGraph, OutputShape, Shaped};

/// Derive [`Shaped`] for a response struct
pub use touchline_derive::OutputShape;
