//! Utility functions for LeaseKV

use std::sync::LazyLock;

/// Regex pattern for SQL identifiers used as table names
static IDENTIFIER_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex pattern")
});

/// Validate that a table name can be spliced into SQL unquoted
///
/// # Examples
///
/// ```
/// use leasekv_common::is_valid_identifier;
///
/// assert!(is_valid_identifier("kv"));
/// assert!(is_valid_identifier("_jobs_2024"));
/// assert!(!is_valid_identifier("1kv"));
/// assert!(!is_valid_identifier("kv; DROP TABLE kv"));
/// ```
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(name) && !name.to_ascii_lowercase().starts_with("sqlite_")
}
