//! Classification of storage faults raised by writes

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{DbError, RepositoryError};
use crate::model::ModelDef;

static DUPLICATE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"duplicate key value violates unique constraint "(?P<key>[^"]+)""#)
        .expect("duplicate key pattern compiles")
});

static DETAIL_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Key \((?P<columns>[^)]+)\)=").expect("detail key pattern compiles")
});

const STILL_REFERENCED: &str = "is still referenced from table";

/// Map a database error from a write on `model` onto the repository taxonomy
///
/// Unique violations become [`RepositoryError::DuplicateEntity`] naming the offending field;
/// foreign-key violations become [`RepositoryError::ReferencedEntity`]. Anything else is passed
/// through unchanged.
pub fn translate(model: &ModelDef, err: DbError) -> RepositoryError {
    if err.is_unique_violation() {
        RepositoryError::DuplicateEntity {
            entity: model.name.to_string(),
            field: duplicate_field(model, &err),
        }
    } else if err.is_foreign_key_violation() {
        let text = err.full_message();
        let message = if text.contains(STILL_REFERENCED) {
            format!("{} is being referenced by another table", model.name)
        } else {
            match &err {
                DbError::Database {
                    detail: Some(detail),
                    ..
                } => detail.trim().to_string(),
                _ => text.rsplit(':').next().unwrap_or_default().trim().to_string(),
            }
        };
        RepositoryError::ReferencedEntity {
            entity: model.name.to_string(),
            message,
        }
    } else {
        RepositoryError::Database(err)
    }
}

/// Translate database faults inside a repository error, leaving other kinds alone
pub fn translate_error(model: &ModelDef, err: RepositoryError) -> RepositoryError {
    match err {
        RepositoryError::Database(db) => translate(model, db),
        other => other,
    }
}

fn duplicate_field(model: &ModelDef, err: &DbError) -> String {
    let constraint = match err {
        DbError::Database {
            constraint: Some(constraint),
            ..
        } => Some(constraint.clone()),
        _ => None,
    }
    .or_else(|| {
        let message = err.full_message();
        DUPLICATE_KEY
            .captures(&message)
            .map(|caps| caps["key"].to_string())
    });

    if let Some(constraint) = constraint {
        return field_from_constraint(model.table, &constraint);
    }

    // No constraint name: fall back to the columns listed in the detail line
    let message = err.full_message();
    DETAIL_KEY
        .captures(&message)
        .map(|caps| caps["columns"].replace(", ", "_"))
        .unwrap_or_else(|| "key".to_string())
}

/// `players_email_key` on `players` names the field `email`
pub fn field_from_constraint(table: &str, constraint: &str) -> String {
    let trimmed = constraint
        .strip_prefix(table)
        .map(|rest| rest.trim_start_matches('_'))
        .unwrap_or(constraint);
    let trimmed = ["_key", "_idx", "_unique", "_uniq"]
        .iter()
        .find_map(|suffix| trimmed.strip_suffix(suffix))
        .unwrap_or(trimmed);
    let field = trimmed.trim_matches('_');
    if field.is_empty() {
        constraint.to_string()
    } else {
        field.to_string()
    }
}
