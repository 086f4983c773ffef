//! Declarative filtering and ordering
//!
//! A [`FilterSpec`] holds `field[__operator] = value` entries for one model, nested specs for
//! relationships, a free-text search entry and an ordering entry. The [`FilterEngine`] turns a
//! spec into WHERE predicates, INNER JOINs and ORDER BY clauses on a select statement.
//!
//! | suffix | predicate |
//! |---|---|
//! | *(none)* | `=` |
//! | `neq` | `<>` |
//! | `gt` `gte` `lt` `lte` | comparisons |
//! | `in` `not_in` | membership; list or comma-separated string |
//! | `isnull` | `IS NULL` / `IS NOT NULL` |
//! | `like` `ilike` | pattern; wrapped in `%...%` unless it already has a `%` |
//! | `not` | `IS NOT` |
//! | `array_contains` `array_overlap` | `@>` / `&&` against a text array column |

mod engine;
mod spec;

pub use engine::{FilterEngine, SortKey};
pub use spec::{FilterOptions, FilterSpec, FilterValue};

/// Decode a comma-separated list; the empty string is the empty list
pub fn decode_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Wrap a pattern in `%` unless the caller placed wildcards already
pub fn normalize_like(pattern: &str) -> String {
    if pattern.contains('%') {
        pattern.to_string()
    } else {
        format!("%{pattern}%")
    }
}
