//! Identifier, placeholder and literal formatting.
//!
//! Besides the pieces used to build statements, this module renders values
//! as SQL literals for diagnostics: [`format_query`] substitutes arguments
//! into a query so errors and logs show the statement that actually ran.

use chrono::SecondsFormat;
use regex::Regex;
use sqldb_core::{Error, QueryError, Result, Value};
use std::fmt::{self, Write as _};
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,58}$").expect("identifier pattern is valid")
});

static TABLE_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z_][A-Za-z0-9_]{0,58}\.)?[A-Za-z_][A-Za-z0-9_]{0,58}$")
        .expect("table pattern is valid")
});

/// Dialect-specific formatting of query fragments.
pub trait QueryFormatter: Send + Sync + fmt::Debug {
    /// Validate and format a table name (optionally schema-qualified).
    fn format_table_name(&self, name: &str) -> Result<String>;

    /// Validate and format a column name.
    fn format_column_name(&self, name: &str) -> Result<String>;

    /// Placeholder for the zero-based parameter `index`.
    fn format_placeholder(&self, index: usize) -> String;

    /// Quote `s` as a string literal.
    fn format_string_literal(&self, s: &str) -> String {
        quote_literal(s)
    }

    /// Stable identifier of the placeholder style, used in cache keys.
    fn placeholder_style(&self) -> &str;

    /// Identifies the SQL this formatter renders; generated statements are
    /// only shared between formatters with the same dialect. Formatter types
    /// whose output depends on more than the placeholder style must override
    /// this.
    fn dialect(&self) -> String {
        format!("{}[{}]", std::any::type_name::<Self>(), self.placeholder_style())
    }
}

/// The PostgreSQL formatter.
///
/// Identifiers must match `[A-Za-z_][A-Za-z0-9_]{0,58}` and are emitted
/// verbatim. Placeholders default to `$N`; a custom format string replaces
/// `%d` with the one-based parameter number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdQueryFormatter {
    placeholder_format: String,
}

impl Default for StdQueryFormatter {
    fn default() -> Self {
        Self {
            placeholder_format: "$%d".to_string(),
        }
    }
}

impl StdQueryFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom placeholder format such as `"?%d"` or `":p%d"`.
    pub fn with_placeholder_format(format: impl Into<String>) -> Self {
        Self {
            placeholder_format: format.into(),
        }
    }
}

impl QueryFormatter for StdQueryFormatter {
    fn format_table_name(&self, name: &str) -> Result<String> {
        if TABLE_IDENTIFIER.is_match(name) {
            Ok(name.to_string())
        } else {
            Err(Error::InvalidIdentifier(name.to_string()))
        }
    }

    fn format_column_name(&self, name: &str) -> Result<String> {
        if IDENTIFIER.is_match(name) {
            Ok(name.to_string())
        } else {
            Err(Error::InvalidIdentifier(name.to_string()))
        }
    }

    fn format_placeholder(&self, index: usize) -> String {
        let number = (index + 1).to_string();
        if self.placeholder_format == "$%d" {
            return format!("${number}");
        }
        self.placeholder_format.replace("%d", &number)
    }

    fn placeholder_style(&self) -> &str {
        &self.placeholder_format
    }
}

/// Quote a string literal: wrap in single quotes and double every quote.
///
/// Backslash-escaped quotes (`\'`) are normalized to `''` first.
pub fn quote_literal(s: &str) -> String {
    let normalized = s.replace("\\'", "'");
    let mut out = String::with_capacity(normalized.len() + 2);
    out.push('\'');
    for c in normalized.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

fn looks_like_json_or_array(text: &str) -> bool {
    let trimmed = text.trim();
    let shaped = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    // PostgreSQL array literals like {1,2} are not JSON but are still text.
    shaped
        && (serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
            || trimmed.starts_with('{'))
}

fn array_literal(items: &[Value]) -> String {
    let mut out = String::from("{");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            Value::Null => out.push_str("NULL"),
            Value::Text(s) => {
                out.push('"');
                out.push_str(&s.replace('\\', "\\\\").replace('"', "\\\""));
                out.push('"');
            }
            Value::Array(nested) => out.push_str(&array_literal(nested)),
            other => out.push_str(&other.to_plain_string()),
        }
    }
    out.push('}');
    out
}

/// Render a value as an SQL literal for diagnostics.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Text(s) => quote_literal(s),
        Value::Timestamp(t) => quote_literal(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        Value::Json(j) => quote_literal(&j.to_string()),
        Value::Array(items) => quote_literal(&array_literal(items)),
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) if looks_like_json_or_array(text) => quote_literal(text),
            _ => {
                let mut out = String::with_capacity(bytes.len() * 2 + 4);
                out.push_str("'\\x");
                for b in bytes {
                    let _ = write!(out, "{b:02x}");
                }
                out.push('\'');
                out
            }
        },
    }
}

/// Substitute `args` into the placeholders of `query`.
///
/// The query is scanned once, left to right, so substituted values are never
/// rescanned. A placeholder only matches when it is not followed by another
/// digit: with two arguments `$1` is substituted but `$10` and `$12` are left
/// as they are.
pub fn format_query(query: &str, args: &[Value], formatter: &dyn QueryFormatter) -> String {
    if args.is_empty() {
        return query.to_string();
    }
    let placeholders: Vec<String> = (0..args.len()).map(|i| formatter.format_placeholder(i)).collect();
    let mut out = String::with_capacity(query.len());
    let mut rest = query;
    while let Some(c) = rest.chars().next() {
        let matched = placeholders
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_empty() && rest.starts_with(p.as_str()))
            .filter(|(_, p)| !rest[p.len()..].starts_with(|d: char| d.is_ascii_digit()))
            .max_by_key(|(_, p)| p.len());
        match matched {
            Some((index, placeholder)) => {
                out.push_str(&format_value(&args[index]));
                rest = &rest[placeholder.len()..];
            }
            None => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
    out
}

/// Annotate a driver error with the statement that produced it.
///
/// The annotation is applied once: errors that already carry a query are
/// returned unchanged, and `NoRows` is never wrapped so callers can keep
/// matching on it.
pub fn wrap_error_with_query(
    err: Error,
    query: &str,
    args: &[Value],
    formatter: &dyn QueryFormatter,
) -> Error {
    match err {
        Error::NoRows | Error::WithQuery { .. } => err,
        Error::Query(q) if q.sql.is_some() => Error::Query(q),
        Error::Query(q) => Error::Query(QueryError {
            sql: Some(format_query(query, args, formatter)),
            ..q
        }),
        other => Error::WithQuery {
            query: format_query(query, args, formatter),
            source: Box::new(other),
        },
    }
}
