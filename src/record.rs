//! Dynamic entity records
//!
//! Loaded entities are [`Record`]s: column values keyed by name plus any relationships that were
//! loaded. Records convert to JSON and from there into typed response structs with
//! [`Record::decode`]. The same type carries write input: scalar values, related identifiers
//! ([`Related::Ids`]) or nested partial records.

use sea_query::Value;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

use crate::error::RepositoryError;
use crate::model::{ModelDef, RelationKind};
use crate::value::{coerce, to_json};

#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
    /// Identifiers of related entities, used on write paths
    Ids(Vec<Value>),
}

impl Related {
    pub fn to_json(&self) -> JsonValue {
        match self {
            Related::One(Some(record)) => record.to_json(),
            Related::One(None) => JsonValue::Null,
            Related::Many(records) => JsonValue::Array(records.iter().map(Record::to_json).collect()),
            Related::Ids(ids) => JsonValue::Array(ids.iter().map(to_json).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    values: BTreeMap<String, Value>,
    relations: BTreeMap<String, Related>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Record::set`]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Builder-style [`Record::set_related`]
    pub fn with_related(mut self, name: impl Into<String>, related: Related) -> Self {
        self.set_related(name, related);
        self
    }

    pub fn with_ids<I, V>(self, name: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.with_related(name, Related::Ids(ids.into_iter().map(Into::into).collect()))
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn set_related(&mut self, name: impl Into<String>, related: Related) {
        self.relations.insert(name.into(), related);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn related(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    pub fn related_mut(&mut self, name: &str) -> Option<&mut Related> {
        self.relations.get_mut(name)
    }

    pub fn relations(&self) -> impl Iterator<Item = (&str, &Related)> {
        self.relations.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn take_relations(&mut self) -> BTreeMap<String, Related> {
        std::mem::take(&mut self.relations)
    }

    pub fn id<'a>(&'a self, model: &ModelDef) -> Option<&'a Value> {
        self.values
            .get(model.primary_key)
            .filter(|v| !crate::value::is_null(v))
    }

    /// Merge the values of `other` over this record's
    pub fn merge(&mut self, other: Record) {
        self.values.extend(other.values);
        self.relations.extend(other.relations);
    }

    pub fn to_json(&self) -> JsonValue {
        let mut object = Map::new();
        for (name, value) in &self.values {
            object.insert(name.clone(), to_json(value));
        }
        for (name, related) in &self.relations {
            object.insert(name.clone(), related.to_json());
        }
        JsonValue::Object(object)
    }

    /// Deserialize into a response type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_json())
    }

    /// Build write input for `model` from JSON
    ///
    /// Scalars are coerced to their column type. For relationships an array of scalars is a list
    /// of identifiers, objects are nested records and `null` clears a to-one relationship.
    pub fn from_json(model: &'static ModelDef, json: &JsonValue) -> Result<Record, RepositoryError> {
        let object = json.as_object().ok_or_else(|| {
            RepositoryError::InvalidInput(format!("{} input must be a JSON object", model.name))
        })?;

        let mut record = Record::new();
        for (name, value) in object {
            if let Some(column) = model.column(name) {
                let coerced = coerce(value, column.ty)
                    .map_err(|reason| RepositoryError::InvalidInput(format!("{name}: {reason}")))?;
                record.set(name.clone(), coerced);
            } else if let Some(relation) = model.relation(name) {
                record.set_related(name.clone(), related_from_json(relation.target(), relation.kind, name, value)?);
            } else if let Some((_, column)) = model.find_in_subtypes(name)? {
                let coerced = coerce(value, column.ty)
                    .map_err(|reason| RepositoryError::InvalidInput(format!("{name}: {reason}")))?;
                record.set(name.clone(), coerced);
            } else {
                return Err(RepositoryError::InvalidInput(format!(
                    "unknown field `{name}` for {}",
                    model.name
                )));
            }
        }
        Ok(record)
    }
}

fn related_from_json(
    target: &'static ModelDef,
    kind: RelationKind,
    name: &str,
    value: &JsonValue,
) -> Result<Related, RepositoryError> {
    let to_many = matches!(
        kind,
        RelationKind::HasMany { .. } | RelationKind::ManyToMany { .. }
    );
    match value {
        JsonValue::Null if !to_many => Ok(Related::One(None)),
        JsonValue::Object(_) => Ok(Related::One(Some(Box::new(Record::from_json(target, value)?)))),
        JsonValue::Array(items) if items.iter().all(JsonValue::is_object) && !items.is_empty() => {
            let records = items
                .iter()
                .map(|item| Record::from_json(target, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Related::Many(records))
        }
        JsonValue::Array(items) => {
            let ids = items
                .iter()
                .map(|item| coerce(item, target.primary_key_type()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|reason| RepositoryError::InvalidInput(format!("{name}: {reason}")))?;
            Ok(Related::Ids(ids))
        }
        scalar if !to_many => {
            let id = coerce(scalar, target.primary_key_type())
                .map_err(|reason| RepositoryError::InvalidInput(format!("{name}: {reason}")))?;
            Ok(Related::Ids(vec![id]))
        }
        other => Err(RepositoryError::InvalidInput(format!(
            "{name}: expected a list, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::player;
    use serde::Deserialize;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_to_json_includes_relations() {
        let record = Record::new()
            .with("name", "Ana")
            .with("shirt_number", 9i32)
            .with_related(
                "matches",
                Related::Many(vec![Record::new().with("opponent", "Rivers")]),
            )
            .with_related("captain", Related::One(None));

        assert_eq!(
            record.to_json(),
            json!({
                "name": "Ana",
                "shirt_number": 9,
                "matches": [{"opponent": "Rivers"}],
                "captain": null
            })
        );
    }

    #[test]
    fn test_decode_into_response_type() {
        #[derive(Deserialize)]
        struct Out {
            name: String,
            shirt_number: Option<i32>,
        }
        let out: Out = Record::new()
            .with("name", "Ana")
            .with("shirt_number", None::<i32>)
            .decode()
            .expect("decodes");
        assert_eq!(out.name, "Ana");
        assert_eq!(out.shirt_number, None);
    }

    #[test]
    fn test_from_json_coerces_and_reads_ids() {
        let match_id = Uuid::new_v4();
        let record = Record::from_json(
            player(),
            &json!({
                "name": "Ana",
                "shirt_number": "9",
                "tags": "left,fast",
                "matches": [match_id.to_string()],
                "clean_sheets": 3
            }),
        )
        .expect("valid input");

        assert_eq!(record.get("shirt_number"), Some(&Value::from(9i32)));
        assert_eq!(to_json(record.get("tags").expect("tags")), json!(["left", "fast"]));
        assert_eq!(record.related("matches"), Some(&Related::Ids(vec![Value::from(match_id)])));
        assert_eq!(record.get("clean_sheets"), Some(&Value::from(3i32)));
    }

    #[test]
    fn test_from_json_rejects_unknown_and_bad_values() {
        assert!(matches!(
            Record::from_json(player(), &json!({"nickname": "x"})),
            Err(RepositoryError::InvalidInput(_))
        ));
        assert!(matches!(
            Record::from_json(player(), &json!({"shirt_number": "nine"})),
            Err(RepositoryError::InvalidInput(_))
        ));
        assert!(matches!(
            Record::from_json(player(), &json!(["not", "an", "object"])),
            Err(RepositoryError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_id_ignores_null() {
        let id = Uuid::new_v4();
        assert_eq!(Record::new().with("id", id).id(player()), Some(&Value::from(id)));
        assert!(Record::new().with("id", None::<Uuid>).id(player()).is_none());
    }
}
