//! Data-model descriptors
//!
//! A [`ModelDef`] is the static description of one persisted entity: its table, identity column,
//! scalar columns, relationships and (optionally) subtypes that share its identity but keep
//! extra columns in their own table. Descriptors are `'static` and immutable; relationship
//! targets are reached through `fn() -> &'static ModelDef` so models may refer to each other.

use sea_query::Value;
use std::fmt;

use crate::error::SchemaError;

/// Accessor for a static descriptor
pub type ModelRef = fn() -> &'static ModelDef;

/// Native column types the query layer knows how to bind and coerce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Uuid,
    SmallInt,
    Integer,
    BigInt,
    Double,
    Decimal,
    Boolean,
    Text,
    Date,
    Timestamp,
    TimestampTz,
    Json,
    TextArray,
}

impl ColumnType {
    pub fn is_textual(self) -> bool {
        matches!(self, ColumnType::Text)
    }

    pub fn is_array(self) -> bool {
        matches!(self, ColumnType::TextArray)
    }

    /// Typed SQL NULL for this column type
    pub fn null_value(self) -> Value {
        match self {
            ColumnType::Uuid => Value::from(None::<uuid::Uuid>),
            ColumnType::SmallInt => Value::from(None::<i16>),
            ColumnType::Integer => Value::from(None::<i32>),
            ColumnType::BigInt => Value::from(None::<i64>),
            ColumnType::Double => Value::from(None::<f64>),
            ColumnType::Decimal => Value::from(None::<rust_decimal::Decimal>),
            ColumnType::Boolean => Value::from(None::<bool>),
            ColumnType::Text => Value::from(None::<String>),
            ColumnType::Date => Value::from(None::<chrono::NaiveDate>),
            ColumnType::Timestamp => Value::from(None::<chrono::NaiveDateTime>),
            ColumnType::TimestampTz => Value::from(None::<chrono::DateTime<chrono::Utc>>),
            ColumnType::Json | ColumnType::TextArray => Value::from(None::<serde_json::Value>),
        }
    }
}

/// Whether an attribute is physically stored or computed in application code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Stored,
    Computed,
}

#[derive(Debug)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub storage: Storage,
}

impl ColumnDef {
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            storage: Storage::Stored,
        }
    }

    pub const fn nullable(self) -> Self {
        Self {
            nullable: true,
            ..self
        }
    }

    /// A computed attribute: visible to shapes, never selected
    pub const fn computed(self) -> Self {
        Self {
            storage: Storage::Computed,
            ..self
        }
    }

    pub fn is_stored(&self) -> bool {
        self.storage == Storage::Stored
    }
}

// Descriptors are static; identity is address identity
impl PartialEq for ColumnDef {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ToOne,
    ToMany,
}

/// How a relationship maps onto foreign keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Foreign key lives on this model and points at the target's primary key
    BelongsTo { foreign_key: &'static str },
    /// Foreign key lives on the target and points at this model's primary key
    HasOne { foreign_key: &'static str },
    HasMany { foreign_key: &'static str },
    /// Association table with one key per side
    ManyToMany {
        through: &'static str,
        source_key: &'static str,
        target_key: &'static str,
    },
}

#[derive(Debug)]
pub struct RelationDef {
    pub name: &'static str,
    pub target: ModelRef,
    pub kind: RelationKind,
}

impl RelationDef {
    pub fn target(&self) -> &'static ModelDef {
        (self.target)()
    }

    pub fn cardinality(&self) -> Cardinality {
        match self.kind {
            RelationKind::BelongsTo { .. } | RelationKind::HasOne { .. } => Cardinality::ToOne,
            RelationKind::HasMany { .. } | RelationKind::ManyToMany { .. } => Cardinality::ToMany,
        }
    }

    pub fn is_to_many(&self) -> bool {
        self.cardinality() == Cardinality::ToMany
    }
}

impl PartialEq for RelationDef {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

pub struct ModelDef {
    /// Display name used in error messages
    pub name: &'static str,
    pub table: &'static str,
    pub primary_key: &'static str,
    pub columns: &'static [ColumnDef],
    pub relations: &'static [RelationDef],
    pub subtypes: &'static [ModelRef],
    /// JSON column recording, per field, when it was last changed through `update`
    pub tracking_column: Option<&'static str>,
}

impl fmt::Debug for ModelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDef")
            .field("name", &self.name)
            .field("table", &self.table)
            .finish()
    }
}

impl PartialEq for ModelDef {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table
    }
}

impl Eq for ModelDef {}

impl ModelDef {
    pub fn column(&self, name: &str) -> Option<&'static ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&'static RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn stored_columns(&self) -> impl Iterator<Item = &'static ColumnDef> {
        self.columns.iter().filter(|c| c.is_stored())
    }

    pub fn primary_key_column(&self) -> Option<&'static ColumnDef> {
        self.column(self.primary_key)
    }

    pub fn primary_key_type(&self) -> ColumnType {
        self.column(self.primary_key)
            .map(|c| c.ty)
            .unwrap_or(ColumnType::Uuid)
    }

    pub fn subtypes(&self) -> impl Iterator<Item = &'static ModelDef> + '_ {
        self.subtypes.iter().map(|s| s())
    }

    /// Locate a column that lives on exactly one subtype
    ///
    /// Returns `Ok(None)` when no subtype declares it and `AmbiguousInheritedField` when more
    /// than one does.
    pub fn find_in_subtypes(
        &self,
        name: &str,
    ) -> Result<Option<(&'static ModelDef, &'static ColumnDef)>, SchemaError> {
        let matches: Vec<_> = self
            .subtypes()
            .filter_map(|sub| sub.column(name).map(|col| (sub, col)))
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(*only)),
            many => Err(SchemaError::AmbiguousInheritedField {
                model: self.name.to_string(),
                field: name.to_string(),
                subtypes: many.iter().map(|(sub, _)| sub.name.to_string()).collect(),
            }),
        }
    }

    /// Check the descriptor's own invariants
    pub fn validate(&self) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidModel {
            model: self.name.to_string(),
            reason,
        };

        if self.primary_key_column().is_none() {
            return Err(invalid(format!(
                "primary key `{}` is not a declared column",
                self.primary_key
            )));
        }
        for (idx, column) in self.columns.iter().enumerate() {
            if self.columns[..idx].iter().any(|c| c.name == column.name) {
                return Err(invalid(format!("column `{}` declared twice", column.name)));
            }
            if self.relation(column.name).is_some() {
                return Err(invalid(format!(
                    "`{}` is both a column and a relationship",
                    column.name
                )));
            }
        }
        if let Some(tracking) = self.tracking_column {
            match self.column(tracking) {
                Some(col) if col.ty == ColumnType::Json => {}
                _ => {
                    return Err(invalid(format!(
                        "tracking column `{tracking}` must be a declared json column"
                    )))
                }
            }
        }
        for sub in self.subtypes() {
            if sub.primary_key_column().is_none() {
                return Err(invalid(format!(
                    "subtype `{}` has no identity column `{}`",
                    sub.name, sub.primary_key
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static CLUB: ModelDef = ModelDef {
        name: "Club",
        table: "clubs",
        primary_key: "id",
        columns: &[
            ColumnDef::new("id", ColumnType::Uuid),
            ColumnDef::new("name", ColumnType::Text),
            ColumnDef::new("founded", ColumnType::Date).nullable(),
            ColumnDef::new("display_name", ColumnType::Text).computed(),
        ],
        relations: &[RelationDef {
            name: "home_ground",
            target: ground,
            kind: RelationKind::HasOne { foreign_key: "club_id" },
        }],
        subtypes: &[academy, reserve],
        tracking_column: None,
    };

    static GROUND: ModelDef = ModelDef {
        name: "Ground",
        table: "grounds",
        primary_key: "id",
        columns: &[
            ColumnDef::new("id", ColumnType::Uuid),
            ColumnDef::new("club_id", ColumnType::Uuid),
        ],
        relations: &[],
        subtypes: &[],
        tracking_column: None,
    };

    static ACADEMY: ModelDef = ModelDef {
        name: "Academy",
        table: "academies",
        primary_key: "id",
        columns: &[
            ColumnDef::new("id", ColumnType::Uuid),
            ColumnDef::new("age_group", ColumnType::Text),
            ColumnDef::new("coach", ColumnType::Text),
        ],
        relations: &[],
        subtypes: &[],
        tracking_column: None,
    };

    static RESERVE: ModelDef = ModelDef {
        name: "Reserve",
        table: "reserves",
        primary_key: "id",
        columns: &[
            ColumnDef::new("id", ColumnType::Uuid),
            ColumnDef::new("coach", ColumnType::Text),
        ],
        relations: &[],
        subtypes: &[],
        tracking_column: None,
    };

    fn ground() -> &'static ModelDef {
        &GROUND
    }

    fn academy() -> &'static ModelDef {
        &ACADEMY
    }

    fn reserve() -> &'static ModelDef {
        &RESERVE
    }

    #[test]
    fn test_column_lookup() {
        assert!(CLUB.column("name").is_some());
        assert!(CLUB.column("missing").is_none());
        let stored: Vec<_> = CLUB.stored_columns().map(|c| c.name).collect();
        assert_eq!(stored, vec!["id", "name", "founded"]);
        assert!(CLUB.column("founded").map(|c| c.nullable).unwrap_or(false));
    }

    #[test]
    fn test_relation_cardinality() {
        let rel = CLUB.relation("home_ground").expect("relation declared");
        assert_eq!(rel.cardinality(), Cardinality::ToOne);
        assert_eq!(rel.target().table, "grounds");
    }

    #[test]
    fn test_find_in_subtypes_unique_and_ambiguous() {
        let (sub, col) = CLUB
            .find_in_subtypes("age_group")
            .expect("lookup ok")
            .expect("found on academy");
        assert_eq!(sub.table, "academies");
        assert_eq!(col.name, "age_group");

        assert!(CLUB.find_in_subtypes("nothing").expect("lookup ok").is_none());

        let err = CLUB.find_in_subtypes("coach").unwrap_err();
        assert!(matches!(err, SchemaError::AmbiguousInheritedField { .. }));
    }

    #[test]
    fn test_validate() {
        assert!(CLUB.validate().is_ok());
        assert!(GROUND.validate().is_ok());
    }
}
