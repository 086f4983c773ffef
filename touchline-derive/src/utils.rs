//! Utility functions for code generation

/// Convert string to snake_case
pub fn snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() && i > 0 {
            result.push('_');
        }
        result.extend(c.to_lowercase());
    }
    result
}

/// Convert string to PascalCase
pub fn pascal_case(s: &str) -> String {
    let mut result = String::new();
    let mut capitalize = true;
    for c in s.chars() {
        if c == '_' {
            capitalize = true;
        } else if capitalize {
            result.extend(c.to_uppercase());
            capitalize = false;
        } else {
            result.push(c);
        }
    }
    result
}

/// Convert string to camelCase
pub fn camel_case(s: &str) -> String {
    let mut result = String::new();
    let mut capitalize = false;
    for c in s.chars() {
        if c == '_' {
            capitalize = true;
        } else if capitalize {
            result.extend(c.to_uppercase());
            capitalize = false;
        } else {
            result.push(c);
        }
    }
    result
}

/// Apply a serde-style `rename_all` rule to a field name
pub fn apply_rename_rule(rule: &str, name: &str) -> Option<String> {
    match rule {
        "snake_case" => Some(snake_case(name)),
        "camelCase" => Some(camel_case(name)),
        "PascalCase" => Some(pascal_case(name)),
        "lowercase" => Some(name.to_lowercase()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_conversions() {
        assert_eq!(snake_case("matchDate"), "match_date");
        assert_eq!(camel_case("match_date"), "matchDate");
        assert_eq!(pascal_case("match_date"), "MatchDate");
        assert_eq!(apply_rename_rule("camelCase", "shirt_number").as_deref(), Some("shirtNumber"));
        assert_eq!(apply_rename_rule("kebab-case", "shirt_number"), None);
    }
}
