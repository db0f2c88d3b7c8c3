//! SQL text helpers.
//!
//! Pure string functions used by callers composing statements, plus the
//! statement guard applied before every query.

pub mod guard;

pub use guard::check;

/// Alias given to a statement wrapped by [`window_sql`].
pub const WINDOW_ALIAS: &str = "cdbq_window";

/// Quote an identifier, doubling embedded double quotes.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Quote a string literal.
///
/// Single quotes are doubled. A literal containing backslashes is emitted in
/// escape-string form (` E'...'`) with the backslashes doubled, so it reads the
/// same whatever `standard_conforming_strings` is set to.
pub fn escape_literal(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    let mut has_backslash = false;

    escaped.push('\'');
    for c in value.chars() {
        match c {
            '\'' => escaped.push_str("''"),
            '\\' => {
                escaped.push_str("\\\\");
                has_backslash = true;
            }
            c => escaped.push(c),
        }
    }
    escaped.push('\'');

    if has_backslash {
        format!(" E{}", escaped)
    } else {
        escaped
    }
}

/// Wrap a query so only a window of its rows is returned.
///
/// Only single `SELECT`/`WITH` queries are wrapped; anything else, or a call
/// with neither a limit nor an offset, returns the statement unchanged apart
/// from trailing semicolons and whitespace.
pub fn window_sql(sql: &str, limit: Option<u64>, offset: Option<u64>) -> String {
    let trimmed = sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace());

    if (limit.is_none() && offset.is_none()) || !is_windowable(trimmed) {
        return trimmed.to_string();
    }

    let mut wrapped = format!("SELECT * FROM ({}) AS {}", trimmed, WINDOW_ALIAS);
    if let Some(limit) = limit {
        wrapped.push_str(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = offset {
        wrapped.push_str(&format!(" OFFSET {}", offset));
    }
    wrapped
}

fn is_windowable(sql: &str) -> bool {
    let head = sql.trim_start().trim_start_matches('(').trim_start();
    let keyword: String = head
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    let is_query = keyword.eq_ignore_ascii_case("select") || keyword.eq_ignore_ascii_case("with");
    is_query && !sql.contains(';')
}
