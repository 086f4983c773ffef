use sea_query::SelectStatement;
use serde_json::Value as JsonValue;

use crate::error::FilterError;
use crate::filter::decode_list;
use crate::model::ModelDef;

#[derive(Debug, Clone)]
pub enum FilterValue {
    Value(JsonValue),
    /// Criteria on a related model, joined through the relationship
    Nested(FilterSpec),
}

/// Per-spec knobs that are not criteria
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    /// Columns the free-text search runs across
    pub search_columns: Vec<String>,
    /// Columns sorted with NULLS LAST
    pub nulls_last: Vec<String>,
    /// Derived tables joined in place of a relationship's table when it is filtered on
    pub join_targets: Vec<(String, SelectStatement)>,
}

#[derive(Debug, Clone)]
pub struct FilterSpec {
    model: &'static ModelDef,
    entries: Vec<(String, FilterValue)>,
    search: Option<String>,
    ordering: Vec<String>,
    options: FilterOptions,
}

impl FilterSpec {
    pub fn new(model: &'static ModelDef) -> Self {
        Self {
            model,
            entries: Vec::new(),
            search: None,
            ordering: Vec::new(),
            options: FilterOptions::default(),
        }
    }

    /// Add a `field[__operator]` criterion
    pub fn with(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.entries
            .push((field.into(), FilterValue::Value(value.into())));
        self
    }

    /// Add criteria on a related model
    pub fn nested(mut self, relationship: impl Into<String>, spec: FilterSpec) -> Self {
        self.entries
            .push((relationship.into(), FilterValue::Nested(spec)));
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    /// Ordering tokens: `name`, `+name` or `-name`, comma-separated
    pub fn order_by(mut self, tokens: &str) -> Self {
        self.ordering = decode_list(tokens);
        self
    }

    pub fn search_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.search_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn nulls_last<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.nulls_last = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn join_target(mut self, relationship: impl Into<String>, derived: SelectStatement) -> Self {
        self.options
            .join_targets
            .push((relationship.into(), derived));
        self
    }

    pub fn with_options(mut self, options: FilterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn model(&self) -> &'static ModelDef {
        self.model
    }

    pub fn entries(&self) -> &[(String, FilterValue)] {
        &self.entries
    }

    pub fn search_text(&self) -> Option<&str> {
        self.search.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn ordering(&self) -> &[String] {
        &self.ordering
    }

    pub fn options(&self) -> &FilterOptions {
        &self.options
    }

    pub(crate) fn derived_target(&self, relationship: &str) -> Option<&SelectStatement> {
        self.options
            .join_targets
            .iter()
            .find(|(name, _)| name == relationship)
            .map(|(_, derived)| derived)
    }

    /// True when applying the spec would add no predicate
    pub fn is_empty(&self) -> bool {
        self.search_text().is_none()
            && self.entries.iter().all(|(_, value)| match value {
                FilterValue::Value(v) => v.is_null(),
                FilterValue::Nested(nested) => nested.is_empty(),
            })
    }

    /// Parse a JSON object of criteria
    ///
    /// `search_field` and `ordering_field` name the entries holding the free-text search and
    /// the ordering tokens. An object under a relationship name is a nested spec.
    pub fn from_json(
        model: &'static ModelDef,
        json: &JsonValue,
        search_field: &str,
        ordering_field: &str,
    ) -> Result<Self, FilterError> {
        let object = json.as_object().ok_or_else(|| FilterError::InvalidValue {
            field: model.name.to_string(),
            reason: "filter must be a JSON object".to_string(),
        })?;

        let mut spec = FilterSpec::new(model);
        for (key, value) in object {
            if key == search_field {
                match value {
                    JsonValue::Null => {}
                    JsonValue::String(text) => spec.search = Some(text.clone()),
                    other => spec.search = Some(other.to_string()),
                }
            } else if key == ordering_field {
                spec.ordering = ordering_tokens(key, value)?;
            } else if let (Some(relation), JsonValue::Object(_)) = (model.relation(key), value) {
                let nested =
                    FilterSpec::from_json(relation.target(), value, search_field, ordering_field)?;
                spec.entries.push((key.clone(), FilterValue::Nested(nested)));
            } else {
                spec.entries
                    .push((key.clone(), FilterValue::Value(value.clone())));
            }
        }
        Ok(spec)
    }
}

fn ordering_tokens(field: &str, value: &JsonValue) -> Result<Vec<String>, FilterError> {
    match value {
        JsonValue::Null => Ok(Vec::new()),
        JsonValue::String(raw) => Ok(decode_list(raw)),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| FilterError::InvalidValue {
                        field: field.to_string(),
                        reason: format!("ordering token {item} is not a string"),
                    })
            })
            .collect(),
        other => Err(FilterError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected ordering tokens, got {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::player;
    use serde_json::json;

    #[test]
    fn test_from_json_splits_special_fields() {
        let spec = FilterSpec::from_json(
            player(),
            &json!({
                "name__ilike": "an",
                "search": "ana",
                "order_by": "-goals,name",
                "matches": {"opponent": "Rivers"},
            }),
            "search",
            "order_by",
        )
        .expect("parses");

        assert_eq!(spec.search_text(), Some("ana"));
        assert_eq!(spec.ordering(), &["-goals".to_string(), "name".to_string()]);
        assert_eq!(spec.entries().len(), 2);
        assert!(spec
            .entries()
            .iter()
            .any(|(k, v)| k == "matches" && matches!(v, FilterValue::Nested(_))));
    }

    #[test]
    fn test_is_empty_ignores_nulls_and_ordering() {
        let spec = FilterSpec::new(player())
            .with("name", JsonValue::Null)
            .nested("matches", FilterSpec::new(crate::schema::match_model()))
            .order_by("-goals");
        assert!(spec.is_empty());
        assert!(!spec.with("active", true).is_empty());
        assert!(!FilterSpec::new(player()).search("ana").is_empty());
        assert!(FilterSpec::new(player()).search("  ").is_empty());
    }

    #[test]
    fn test_ordering_array_and_bad_values() {
        let spec = FilterSpec::from_json(
            player(),
            &json!({"order_by": ["-goals", " name "]}),
            "search",
            "order_by",
        )
        .expect("parses");
        assert_eq!(spec.ordering(), &["-goals".to_string(), "name".to_string()]);

        assert!(FilterSpec::from_json(player(), &json!({"order_by": 3}), "search", "order_by").is_err());
        assert!(FilterSpec::from_json(player(), &json!([1]), "search", "order_by").is_err());
    }
}
