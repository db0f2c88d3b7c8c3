//! Statement prefix guard.
//!
//! Session-level `SET` statements would leak settings into pooled connections
//! shared with other tenants, so they are rejected before a connection is
//! acquired. This is a prefix check, not a parser: `SET` anywhere other than
//! at the very start of the submitted text is allowed.

use crate::error::{DbError, DbResult};

/// Operation name reported for rejected statements.
pub const FORBIDDEN_SET: &str = "SET";

/// Result of checking a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardResult {
    Allowed,
    /// Statement starts with a forbidden command
    Forbidden(&'static str),
}

/// Classify a statement.
pub fn inspect(sql: &str) -> GuardResult {
    if starts_with_set(sql.trim_start()) {
        GuardResult::Forbidden(FORBIDDEN_SET)
    } else {
        GuardResult::Allowed
    }
}

/// Reject statements that start with `SET`.
///
/// Leading whitespace is ignored, and `set` must be followed by whitespace.
pub fn check(sql: &str) -> DbResult<()> {
    match inspect(sql) {
        GuardResult::Allowed => Ok(()),
        GuardResult::Forbidden(operation) => Err(DbError::forbidden(operation)),
    }
}

fn starts_with_set(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    bytes.len() > 3
        && bytes[..3].eq_ignore_ascii_case(b"set")
        && sql[3..].starts_with(char::is_whitespace)
}
