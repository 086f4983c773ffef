use sea_query::{Condition, Expr, ExprTrait, JoinType, NullOrdering, Order, SelectStatement, Value};
use serde_json::Value as JsonValue;

use crate::config::QuerySettings;
use crate::error::FilterError;
use crate::filter::spec::{FilterSpec, FilterValue};
use crate::filter::{decode_list, normalize_like};
use crate::model::{ColumnDef, ColumnType, ModelDef};
use crate::sql::{col, filter_alias, join_relation_to, quoted_col};
use crate::value::coerce;

const OPERATORS: &[&str] = &[
    "neq",
    "gt",
    "gte",
    "in",
    "isnull",
    "lt",
    "lte",
    "like",
    "ilike",
    "not",
    "not_in",
    "array_contains",
    "array_overlap",
];

/// One ORDER BY term on the root model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortKey {
    pub column: &'static ColumnDef,
    pub descending: bool,
    pub nulls_last: bool,
}

impl SortKey {
    pub fn apply(&self, select: &mut SelectStatement, alias: &str) {
        let order = if self.descending { Order::Desc } else { Order::Asc };
        if self.nulls_last {
            select.order_by_expr_with_nulls(col(alias, self.column.name), order, NullOrdering::Last);
        } else {
            select.order_by_expr(col(alias, self.column.name), order);
        }
    }
}

/// Applies [`FilterSpec`]s to select statements
#[derive(Debug, Clone)]
pub struct FilterEngine {
    search_field: String,
    ordering_field: String,
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new(&QuerySettings::default())
    }
}

impl FilterEngine {
    pub fn new(settings: &QuerySettings) -> Self {
        Self {
            search_field: settings.search_field.clone(),
            ordering_field: settings.ordering_field.clone(),
        }
    }

    /// Parse JSON criteria using the configured search and ordering field names
    pub fn parse(&self, model: &'static ModelDef, json: &JsonValue) -> Result<FilterSpec, FilterError> {
        FilterSpec::from_json(model, json, &self.search_field, &self.ordering_field)
    }

    /// Add the spec's joins and predicates to `select`, whose root is aliased `alias`
    ///
    /// Applying an empty spec leaves the statement unchanged.
    pub fn apply_filter(
        &self,
        select: &mut SelectStatement,
        alias: &str,
        spec: &FilterSpec,
    ) -> Result<(), FilterError> {
        let mut predicates = Vec::new();
        self.apply_level(select, alias, spec, &mut predicates)?;
        for predicate in predicates {
            select.cond_where(predicate);
        }
        Ok(())
    }

    fn apply_level(
        &self,
        select: &mut SelectStatement,
        alias: &str,
        spec: &FilterSpec,
        predicates: &mut Vec<Condition>,
    ) -> Result<(), FilterError> {
        let model = spec.model();
        for (field, value) in spec.entries() {
            match value {
                FilterValue::Value(json) if json.is_null() => continue,
                FilterValue::Value(json) => {
                    predicates.push(Condition::all().add(predicate(model, alias, field, json)?));
                }
                FilterValue::Nested(nested) => {
                    if nested.is_empty() {
                        continue;
                    }
                    let relation =
                        model
                            .relation(field)
                            .ok_or_else(|| FilterError::UnknownRelationship {
                                model: model.name.to_string(),
                                field: field.clone(),
                            })?;
                    let join_alias = filter_alias(alias, field);
                    join_relation_to(
                        select,
                        JoinType::InnerJoin,
                        model,
                        alias,
                        relation,
                        &join_alias,
                        spec.derived_target(field),
                    );
                    self.apply_level(select, &join_alias, nested, predicates)?;
                }
            }
        }

        if let Some(text) = spec.search_text() {
            predicates.push(search_condition(spec, alias, text)?);
        }
        Ok(())
    }

    /// Resolve ordering tokens against the spec's model
    pub fn sort_keys(&self, spec: &FilterSpec) -> Result<Vec<SortKey>, FilterError> {
        let model = spec.model();
        let mut keys = Vec::new();
        for token in spec.ordering() {
            let (descending, name) = match token.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, token.strip_prefix('+').unwrap_or(token)),
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let column = stored_column(model, name)?;
            keys.push(SortKey {
                column,
                descending,
                nulls_last: spec.options().nulls_last.iter().any(|c| c == name),
            });
        }
        Ok(keys)
    }

    /// Add the spec's ordering to `select`
    pub fn apply_sort(
        &self,
        select: &mut SelectStatement,
        alias: &str,
        spec: &FilterSpec,
    ) -> Result<(), FilterError> {
        for key in self.sort_keys(spec)? {
            key.apply(select, alias);
        }
        Ok(())
    }

    /// Whether the spec joins a to-many relationship, which can repeat root rows
    pub fn joins_collections(&self, spec: &FilterSpec) -> bool {
        let model = spec.model();
        spec.entries().iter().any(|(field, value)| match value {
            FilterValue::Nested(nested) if !nested.is_empty() => {
                model.relation(field).is_some_and(|r| r.is_to_many())
                    || self.joins_collections(nested)
            }
            _ => false,
        })
    }
}

fn stored_column(model: &ModelDef, name: &str) -> Result<&'static ColumnDef, FilterError> {
    model
        .column(name)
        .filter(|c| c.is_stored())
        .ok_or_else(|| FilterError::UnknownColumn {
            model: model.name.to_string(),
            column: name.to_string(),
        })
}

fn search_condition(spec: &FilterSpec, alias: &str, text: &str) -> Result<Condition, FilterError> {
    let model = spec.model();
    let columns = &spec.options().search_columns;
    if columns.is_empty() {
        return Err(FilterError::InvalidValue {
            field: "search".to_string(),
            reason: format!("no search columns configured for {}", model.name),
        });
    }
    let pattern = normalize_like(text);
    let mut any = Condition::any();
    for name in columns {
        let column = stored_column(model, name)?;
        any = any.add(pattern_expr(alias, column, "ILIKE", &pattern));
    }
    Ok(any)
}

fn pattern_expr(alias: &str, column: &ColumnDef, operator: &str, pattern: &str) -> Expr {
    let target = if column.ty.is_textual() {
        quoted_col(alias, column.name)
    } else {
        format!("CAST({} AS TEXT)", quoted_col(alias, column.name))
    };
    Expr::cust_with_values(format!("{target} {operator} ?"), [Value::from(pattern.to_string())])
}

fn invalid(field: &str, reason: String) -> FilterError {
    FilterError::InvalidValue {
        field: field.to_string(),
        reason,
    }
}

fn list_items(value: &JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => items.clone(),
        JsonValue::String(raw) => decode_list(raw).into_iter().map(JsonValue::String).collect(),
        other => vec![other.clone()],
    }
}

fn text_items(field: &str, value: &JsonValue) -> Result<Vec<Value>, FilterError> {
    list_items(value)
        .iter()
        .map(|item| match item {
            JsonValue::String(s) => Ok(Value::from(s.clone())),
            JsonValue::Number(n) => Ok(Value::from(n.to_string())),
            other => Err(invalid(field, format!("{other} is not a text element"))),
        })
        .collect()
}

/// Build the predicate for one `field[__operator]` entry
fn predicate(model: &ModelDef, alias: &str, field: &str, value: &JsonValue) -> Result<Expr, FilterError> {
    let (name, operator) = match field.split_once("__") {
        Some((name, operator)) => (name, Some(operator)),
        None => (field, None),
    };
    if let Some(operator) = operator {
        if !OPERATORS.contains(&operator) {
            return Err(FilterError::UnknownOperator {
                field: name.to_string(),
                operator: operator.to_string(),
            });
        }
    }
    let column = stored_column(model, name)?;
    let target = col(alias, column.name);
    let scalar = |value: &JsonValue| coerce(value, column.ty).map_err(|reason| invalid(field, reason));

    let expr = match operator {
        None => target.eq(scalar(value)?),
        Some("neq") => target.ne(scalar(value)?),
        Some("gt") => target.gt(scalar(value)?),
        Some("gte") => target.gte(scalar(value)?),
        Some("lt") => target.lt(scalar(value)?),
        Some("lte") => target.lte(scalar(value)?),
        Some(op @ ("in" | "not_in")) => {
            let values = list_items(value)
                .iter()
                .map(scalar)
                .collect::<Result<Vec<_>, _>>()?;
            if op == "in" {
                target.is_in(values)
            } else {
                target.is_not_in(values)
            }
        }
        Some("isnull") => match coerce(value, ColumnType::Boolean).map_err(|r| invalid(field, r))? {
            Value::Bool(Some(true)) => target.is_null(),
            _ => target.is_not_null(),
        },
        Some(op @ ("like" | "ilike")) => {
            let pattern = match value {
                JsonValue::String(s) => normalize_like(s),
                other => normalize_like(&other.to_string()),
            };
            pattern_expr(alias, column, if op == "like" { "LIKE" } else { "ILIKE" }, &pattern)
        }
        Some("not") => target.is_not(scalar(value)?),
        Some(op @ ("array_contains" | "array_overlap")) => {
            if !column.ty.is_array() {
                return Err(invalid(field, format!("`{name}` is not an array column")));
            }
            let items = text_items(field, value)?;
            let placeholders = vec!["?"; items.len()].join(", ");
            let operator = if op == "array_contains" { "@>" } else { "&&" };
            Expr::cust_with_values(
                format!(
                    "{} {operator} ARRAY[{placeholders}]::text[]",
                    quoted_col(alias, column.name)
                ),
                items,
            )
        }
        Some(other) => {
            return Err(FilterError::UnknownOperator {
                field: name.to_string(),
                operator: other.to_string(),
            })
        }
    };
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{match_model, player};
    use crate::sql::{build_select, iden, select_from};
    use serde_json::json;

    fn render(spec: &FilterSpec) -> (String, sea_query::Values) {
        let engine = FilterEngine::default();
        let mut select = select_from(spec.model());
        select.column((iden(spec.model().table), iden("id")));
        engine
            .apply_filter(&mut select, spec.model().table, spec)
            .expect("filter applies");
        engine
            .apply_sort(&mut select, spec.model().table, spec)
            .expect("sort applies");
        build_select(&select)
    }

    #[test]
    fn test_equality_and_comparisons_coerce_values() {
        let spec = FilterSpec::new(player())
            .with("active", "true")
            .with("shirt_number__gte", "7")
            .with("position__neq", "goalkeeper");
        let (sql, values) = render(&spec);
        assert!(sql.contains(r#""players"."active" = $1"#), "{sql}");
        assert!(sql.contains(r#""players"."shirt_number" >= $2"#), "{sql}");
        assert!(sql.contains(r#""players"."position" <> $3"#), "{sql}");
        assert_eq!(values.0[0], Value::from(true));
        assert_eq!(values.0[1], Value::from(7i32));
    }

    #[test]
    fn test_membership_from_comma_string() {
        let (sql, values) = render(&FilterSpec::new(player()).with("position__in", "left,right"));
        assert!(sql.contains(r#""players"."position" IN ($1, $2)"#), "{sql}");
        assert_eq!(values.0.len(), 2);

        let (sql, _) = render(&FilterSpec::new(player()).with("position__not_in", json!(["left"])));
        assert!(sql.contains("NOT IN ($1)"), "{sql}");
    }

    #[test]
    fn test_isnull_like_and_not() {
        let (sql, values) = render(
            &FilterSpec::new(player())
                .with("birth_date__isnull", true)
                .with("email__isnull", "false")
                .with("name__ilike", "an")
                .with("last_name__like", "Sm%")
                .with("active__not", true),
        );
        assert!(sql.contains(r#""players"."birth_date" IS NULL"#), "{sql}");
        assert!(sql.contains(r#""players"."email" IS NOT NULL"#), "{sql}");
        assert!(sql.contains(r#""players"."name" ILIKE $1"#), "{sql}");
        assert!(sql.contains(r#""players"."last_name" LIKE $2"#), "{sql}");
        assert!(sql.contains(r#""players"."active" IS NOT $3"#), "{sql}");
        assert_eq!(values.0[0], Value::from("%an%"));
        assert_eq!(values.0[1], Value::from("Sm%"));
    }

    #[test]
    fn test_array_operators() {
        let (sql, values) = render(&FilterSpec::new(player()).with("tags__array_contains", "fast,left"));
        assert!(sql.contains(r#""players"."tags" @> ARRAY[$1, $2]::text[]"#), "{sql}");
        assert_eq!(values.0.len(), 2);

        let (sql, _) = render(&FilterSpec::new(player()).with("tags__array_overlap", json!(["fast"])));
        assert!(sql.contains(r#""players"."tags" && ARRAY[$1]::text[]"#), "{sql}");

        let engine = FilterEngine::default();
        let mut select = select_from(player());
        let err = engine
            .apply_filter(&mut select, "players", &FilterSpec::new(player()).with("name__array_contains", "x"))
            .unwrap_err();
        assert!(matches!(err, FilterError::InvalidValue { .. }));
    }

    #[test]
    fn test_nested_filter_joins_association() {
        let spec = FilterSpec::new(player())
            .nested("matches", FilterSpec::new(match_model()).with("opponent", "Rivers"));
        let (sql, _) = render(&spec);
        assert!(sql.contains(r#"INNER JOIN "match_squads" AS "players__matches__through""#), "{sql}");
        assert!(sql.contains(r#"INNER JOIN "matches" AS "players__matches""#), "{sql}");
        assert!(sql.contains(r#""players__matches"."opponent" = $1"#), "{sql}");
        assert!(FilterEngine::default().joins_collections(&spec));
    }

    #[test]
    fn test_empty_nested_and_null_values_are_no_ops() {
        let spec = FilterSpec::new(player())
            .with("name", JsonValue::Null)
            .nested("matches", FilterSpec::new(match_model()));
        let (filtered, values) = render(&spec);
        let (plain, _) = render(&FilterSpec::new(player()));
        assert_eq!(filtered, plain);
        assert!(values.0.is_empty());
        assert!(!FilterEngine::default().joins_collections(&spec));
    }

    #[test]
    fn test_search_ors_configured_columns() {
        let spec = FilterSpec::new(player())
            .search("ana")
            .search_columns(["name", "last_name"]);
        let (sql, values) = render(&spec);
        assert!(
            sql.contains(r#""players"."name" ILIKE $1 OR "players"."last_name" ILIKE $2"#),
            "{sql}"
        );
        assert_eq!(values.0[0], Value::from("%ana%"));

        let engine = FilterEngine::default();
        let mut select = select_from(player());
        assert!(engine
            .apply_filter(&mut select, "players", &FilterSpec::new(player()).search("ana"))
            .is_err());
    }

    #[test]
    fn test_sort_tokens_and_nulls_last() {
        let spec = FilterSpec::new(player())
            .order_by("-goals,+name,shirt_number")
            .nulls_last(["shirt_number"]);
        let (sql, _) = render(&spec);
        assert!(sql.contains(
            r#"ORDER BY "players"."goals" DESC, "players"."name" ASC, "players"."shirt_number" ASC NULLS LAST"#
        ), "{sql}");
    }

    #[test]
    fn test_errors() {
        let engine = FilterEngine::default();
        let mut select = select_from(player());

        let err = engine
            .apply_filter(&mut select, "players", &FilterSpec::new(player()).with("nickname", "x"))
            .unwrap_err();
        assert!(matches!(err, FilterError::UnknownColumn { .. }));

        let err = engine
            .apply_filter(&mut select, "players", &FilterSpec::new(player()).with("name__between", "x"))
            .unwrap_err();
        assert!(matches!(err, FilterError::UnknownOperator { operator, .. } if operator == "between"));

        let err = engine
            .apply_filter(
                &mut select,
                "players",
                &FilterSpec::new(player()).nested("coach", FilterSpec::new(player()).with("name", "x")),
            )
            .unwrap_err();
        assert!(matches!(err, FilterError::UnknownRelationship { .. }));

        let err = engine
            .apply_filter(&mut select, "players", &FilterSpec::new(player()).with("shirt_number", "nine"))
            .unwrap_err();
        assert!(matches!(err, FilterError::InvalidValue { .. }));

        let err = engine
            .sort_keys(&FilterSpec::new(player()).order_by("-nickname"))
            .unwrap_err();
        assert!(matches!(err, FilterError::UnknownColumn { .. }));
    }
}
