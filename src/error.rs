//! Error taxonomy
//!
//! Errors are layered the way the crate is: [`DbError`] comes out of the executor seam,
//! [`SchemaError`] and [`FilterError`] are raised while a query is being *built* (before any
//! statement is sent), and [`RepositoryError`] is what repository callers see. Database faults
//! on writes are classified into `DuplicateEntity` / `ReferencedEntity` by
//! [`crate::repository`] after the unit of work has been rolled back.

use std::collections::BTreeSet;

use thiserror::Error;

/// SQLSTATE for `unique_violation`
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for `foreign_key_violation`
pub const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Errors raised at the executor seam
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DbError {
    /// Error reported by PostgreSQL itself
    #[error("database error: {message}")]
    Database {
        /// SQLSTATE code, when the server sent one
        code: Option<String>,
        message: String,
        constraint: Option<String>,
        detail: Option<String>,
    },
    /// Connection-level failure (closed socket, protocol error)
    #[error("connection error: {0}")]
    Connection(String),
    /// A column value could not be decoded into a `sea_query::Value`
    #[error("decode error: {0}")]
    Decode(String),
    /// A `sea_query::Value` could not be bound as a statement parameter
    #[error("encode error: {0}")]
    Encode(String),
    /// The unit of work was used after commit/rollback consumed it
    #[error("unit of work has already been closed")]
    TransactionClosed,
    #[error("execution error: {0}")]
    Other(String),
}

impl DbError {
    /// Build a server error from its parts, mostly useful for scripted sessions in tests
    pub fn database(
        code: impl Into<String>,
        message: impl Into<String>,
        constraint: Option<&str>,
        detail: Option<&str>,
    ) -> Self {
        DbError::Database {
            code: Some(code.into()),
            message: message.into(),
            constraint: constraint.map(str::to_string),
            detail: detail.map(str::to_string),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            DbError::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Message and detail joined the way psql prints them
    pub fn full_message(&self) -> String {
        match self {
            DbError::Database {
                message,
                detail: Some(detail),
                ..
            } => format!("{message}\nDETAIL:  {detail}"),
            other => other.to_string(),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        self.code() == Some(UNIQUE_VIOLATION)
            || self
                .full_message()
                .contains("duplicate key value violates unique constraint")
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        self.code() == Some(FOREIGN_KEY_VIOLATION)
            || self.full_message().contains("violates foreign key constraint")
    }
}

impl From<may_postgres::Error> for DbError {
    fn from(err: may_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => DbError::Database {
                code: Some(db.code().code().to_string()),
                message: db.message().to_string(),
                constraint: db.constraint().map(str::to_string),
                detail: db.detail().map(str::to_string),
            },
            None if err.is_closed() => DbError::Connection(err.to_string()),
            None => DbError::Other(err.to_string()),
        }
    }
}

/// Faults in output-shape extraction, plan building and plan compilation
///
/// These indicate drift between an output shape and the data model. They are raised before any
/// statement is issued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("relationship `{relationship}` not found on model `{model}`")]
    RelationshipNotFound { model: String, relationship: String },
    #[error("invalid column reference `{column}` on model `{model}`")]
    InvalidColumnReference { model: String, column: String },
    #[error("`{field}` on model `{model}` is not a column field")]
    NotAColumnField { model: String, field: String },
    #[error("field `{field}` of model `{model}` is declared by more than one subtype: {subtypes:?}")]
    AmbiguousInheritedField {
        model: String,
        field: String,
        subtypes: Vec<String>,
    },
    #[error("unknown field `{field}` requested on model `{model}`")]
    UnknownField { model: String, field: String },
    #[error("field `{field}` of shape `{shape}` is used both as a scalar and as a nested shape")]
    InconsistentShape { shape: String, field: String },
    #[error("shape `{shape}` nests deeper than the configured maximum of {max_depth}")]
    ShapeTooDeep { shape: String, max_depth: usize },
    #[error("loading directive for `{directive_model}` applied to a query over `{model}`")]
    ForeignDirective { model: String, directive_model: String },
    #[error("model `{model}` is inconsistent: {reason}")]
    InvalidModel { model: String, reason: String },
}

/// Faults while translating a filter specification into predicates
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("unknown filter column `{column}` on model `{model}`")]
    UnknownColumn { model: String, column: String },
    #[error("unknown filter operator `{operator}` for field `{field}`")]
    UnknownOperator { field: String, operator: String },
    #[error("nested filter `{field}` does not name a relationship of `{model}`")]
    UnknownRelationship { model: String, field: String },
    #[error("invalid value for filter `{field}`: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors returned by repository operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RepositoryError {
    #[error("{entity} not found")]
    NotFound { entity: String, id: String },
    #[error("{entity} with the same {field} already exists")]
    DuplicateEntity { entity: String, field: String },
    /// Foreign-key violation: the row is still referenced, or a referenced row is missing
    #[error("{message}")]
    ReferencedEntity { entity: String, message: String },
    /// Many-to-many ids supplied on write that do not resolve to persisted rows
    #[error("Foreign key violation: {relationship} with ids {missing:?} not found")]
    ReferencedEntityMissing {
        relationship: String,
        missing: BTreeSet<String>,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A loaded record does not fit the requested response type
    #[error("cannot decode {entity} into the response type: {reason}")]
    Decode { entity: String, reason: String },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Database(#[from] DbError),
}

pub type Result<T, E = RepositoryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_violation_by_code_or_message() {
        let by_code = DbError::database(UNIQUE_VIOLATION, "boom", None, None);
        assert!(by_code.is_unique_violation());

        let by_text = DbError::Database {
            code: None,
            message: "duplicate key value violates unique constraint \"players_email_key\"".into(),
            constraint: None,
            detail: None,
        };
        assert!(by_text.is_unique_violation());
        assert!(!by_text.is_foreign_key_violation());
    }

    #[test]
    fn test_full_message_includes_detail() {
        let err = DbError::database(
            FOREIGN_KEY_VIOLATION,
            "update or delete on table \"players\" violates foreign key constraint \"statistics_player_id_fkey\" on table \"statistics\"",
            Some("statistics_player_id_fkey"),
            Some("Key (id)=(1) is still referenced from table \"statistics\"."),
        );
        assert!(err.full_message().contains("is still referenced from table"));
        assert!(err.is_foreign_key_violation());
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::DuplicateEntity {
            entity: "Players".into(),
            field: "email".into(),
        };
        assert_eq!(err.to_string(), "Players with the same email already exists");

        let missing: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        let err = RepositoryError::ReferencedEntityMissing {
            relationship: "matches".into(),
            missing,
        };
        assert!(err.to_string().starts_with("Foreign key violation: matches"));
    }
}
