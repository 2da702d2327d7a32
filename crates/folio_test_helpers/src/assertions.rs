//! Domain-specific assertions for Folio tests

use predicates::prelude::*;
use predicates::str::contains;

/// Assert that stderr does NOT contain any of the given strings
pub fn stderr_not_contains(values: &[&str]) -> impl Predicate<str> {
    let owned_values: Vec<String> = values.iter().map(|&s| s.to_string()).collect();
    predicate::function(move |s: &str| !owned_values.iter().any(|v| s.contains(v.as_str())))
}

/// Assert that a string looks like a serialized annotated-text schema
///
/// # Example
/// ```rust
/// use folio_test_helpers::assertions::schema_json;
/// use predicates::prelude::*;
///
/// assert!(schema_json().eval(r#"{"content":"hi","annotations":[]}"#));
/// ```
pub fn schema_json() -> impl Predicate<str> {
    contains("\"content\"").and(contains("\"annotations\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_not_contains() {
        assert!(stderr_not_contains(&["ERROR", "WARN"]).eval("all quiet"));
        assert!(!stderr_not_contains(&["ERROR"]).eval("ERROR: relay refused"));
    }

    #[test]
    fn test_schema_json() {
        assert!(schema_json().eval(r#"{"content":"","annotations":[]}"#));
        assert!(!schema_json().eval(r#"{"data":"test"}"#));
    }
}
