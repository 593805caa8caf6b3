//! SQL statement builders for record and values-map operations.
//!
//! Builders only assemble text; callers bind the arguments. Parameter
//! numbers always follow the position of the column in the input list so
//! the same parameter can be referenced from several clauses (the `SET` of
//! an upsert reuses the `VALUES` placeholders).

use crate::format::{QueryFormatter, StdQueryFormatter};
use sqldb_core::{ColumnInfo, Error, Result, Value, Values};
use std::fmt;
use std::sync::Arc;

/// Statement construction for one SQL dialect.
pub trait QueryBuilder: Send + Sync + fmt::Debug {
    /// Formatter used for identifiers and placeholders.
    fn formatter(&self) -> &dyn QueryFormatter;

    /// `SELECT * FROM t WHERE pk0 = $1 AND pk1 = $2 ...`
    fn select_by_pk(&self, table: &str, pk_columns: &[&str]) -> Result<String>;

    /// `INSERT INTO t(c0,...,cn) VALUES($1,...,$n+1)`
    fn insert(&self, table: &str, columns: &[&str]) -> Result<String>;

    /// An insert that returns a row only when it did not conflict on
    /// `on_conflict`.
    fn insert_unique(&self, table: &str, columns: &[&str], on_conflict: &str) -> Result<String>;

    /// An insert that updates all non-primary-key columns on a primary-key
    /// conflict.
    fn upsert(&self, table: &str, columns: &[ColumnInfo]) -> Result<String>;

    /// `UPDATE t SET ... WHERE <where_clause>` from a values map.
    ///
    /// `where_clause` may reference `where_args` as `$1..$k`; the `SET`
    /// placeholders continue after them. Returns the query together with
    /// `where_args` followed by the values in column order.
    fn update_values(
        &self,
        table: &str,
        values: &Values,
        where_clause: &str,
        where_args: &[Value],
    ) -> Result<(String, Vec<Value>)>;

    /// `UPDATE t SET <non-pk> WHERE <pk>` where every column is bound to the
    /// parameter at its position in `columns`.
    fn update_columns_by_pk(&self, table: &str, columns: &[ColumnInfo]) -> Result<String>;

    /// Identifies the SQL this builder generates, including its formatter.
    /// Record DML caches statements per dialect.
    fn dialect(&self) -> String {
        format!("{}/{}", std::any::type_name::<Self>(), self.formatter().dialect())
    }
}

/// The PostgreSQL query builder.
#[derive(Debug, Clone)]
pub struct StdQueryBuilder {
    formatter: Arc<dyn QueryFormatter>,
}

impl Default for StdQueryBuilder {
    fn default() -> Self {
        Self::new(Arc::new(StdQueryFormatter::new()))
    }
}

impl StdQueryBuilder {
    pub fn new(formatter: Arc<dyn QueryFormatter>) -> Self {
        Self { formatter }
    }

    fn column_list<S: AsRef<str>>(&self, columns: &[S]) -> Result<String> {
        let mut names = Vec::with_capacity(columns.len());
        for column in columns {
            names.push(self.formatter.format_column_name(column.as_ref())?);
        }
        Ok(names.join(","))
    }

    fn placeholder_list(&self, count: usize) -> String {
        (0..count)
            .map(|i| self.formatter.format_placeholder(i))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn assignment(&self, column: &str, index: usize) -> Result<String> {
        Ok(format!(
            "{}={}",
            self.formatter.format_column_name(column)?,
            self.formatter.format_placeholder(index)
        ))
    }

    fn condition(&self, column: &str, index: usize) -> Result<String> {
        Ok(format!(
            "{} = {}",
            self.formatter.format_column_name(column)?,
            self.formatter.format_placeholder(index)
        ))
    }
}

/// Strip a single pair of parentheses enclosing the whole expression.
fn trim_outer_parens(expr: &str) -> &str {
    let trimmed = expr.trim();
    let Some(inner) = trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
    else {
        return trimmed;
    };
    // "(a) OR (b)" starts and ends with parens that do not pair up.
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return trimmed;
                }
            }
            _ => {}
        }
    }
    inner.trim()
}

impl QueryBuilder for StdQueryBuilder {
    fn formatter(&self) -> &dyn QueryFormatter {
        self.formatter.as_ref()
    }

    fn select_by_pk(&self, table: &str, pk_columns: &[&str]) -> Result<String> {
        let table = self.formatter.format_table_name(table)?;
        if pk_columns.is_empty() {
            return Err(Error::no_primary_key(&table));
        }
        let mut conditions = Vec::with_capacity(pk_columns.len());
        for (i, column) in pk_columns.iter().enumerate() {
            conditions.push(self.condition(column, i)?);
        }
        Ok(format!(
            "SELECT * FROM {table} WHERE {}",
            conditions.join(" AND ")
        ))
    }

    fn insert(&self, table: &str, columns: &[&str]) -> Result<String> {
        let table = self.formatter.format_table_name(table)?;
        if columns.is_empty() {
            return Err(Error::no_values());
        }
        Ok(format!(
            "INSERT INTO {table}({}) VALUES({})",
            self.column_list(columns)?,
            self.placeholder_list(columns.len())
        ))
    }

    fn insert_unique(&self, table: &str, columns: &[&str], on_conflict: &str) -> Result<String> {
        let insert = self.insert(table, columns)?;
        Ok(format!(
            "{insert} ON CONFLICT ({}) DO NOTHING RETURNING TRUE",
            trim_outer_parens(on_conflict)
        ))
    }

    fn upsert(&self, table: &str, columns: &[ColumnInfo]) -> Result<String> {
        let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
        let insert = self.insert(table, &names)?;

        let mut pk = Vec::new();
        let mut sets = Vec::new();
        for (i, column) in columns.iter().enumerate() {
            if column.primary_key {
                pk.push(self.formatter.format_column_name(column.name)?);
            } else {
                sets.push(self.assignment(column.name, i)?);
            }
        }
        if pk.is_empty() {
            return Err(Error::no_primary_key(table));
        }

        let pk = pk.join(",");
        if sets.is_empty() {
            // Nothing to update; a bare DO UPDATE SET is not valid SQL.
            return Ok(format!("{insert} ON CONFLICT({pk}) DO NOTHING"));
        }
        Ok(format!(
            "{insert} ON CONFLICT({pk}) DO UPDATE SET {}",
            sets.join(", ")
        ))
    }

    fn update_values(
        &self,
        table: &str,
        values: &Values,
        where_clause: &str,
        where_args: &[Value],
    ) -> Result<(String, Vec<Value>)> {
        let table = self.formatter.format_table_name(table)?;
        if values.is_empty() {
            return Err(Error::no_values());
        }
        let (columns, column_values) = values.sorted_columns_and_values();

        let offset = where_args.len();
        let mut sets = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            sets.push(self.assignment(column, offset + i)?);
        }

        let mut query = format!("UPDATE {table} SET {}", sets.join(", "));
        let where_clause = where_clause.trim();
        if !where_clause.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(where_clause);
        }

        let mut args = Vec::with_capacity(offset + column_values.len());
        args.extend_from_slice(where_args);
        args.extend(column_values);
        Ok((query, args))
    }

    fn update_columns_by_pk(&self, table: &str, columns: &[ColumnInfo]) -> Result<String> {
        let table = self.formatter.format_table_name(table)?;
        let mut sets = Vec::new();
        let mut conditions = Vec::new();
        for (i, column) in columns.iter().enumerate() {
            if column.primary_key {
                conditions.push(self.condition(column.name, i)?);
            } else {
                sets.push(self.assignment(column.name, i)?);
            }
        }
        if conditions.is_empty() {
            return Err(Error::no_primary_key(&table));
        }
        if sets.is_empty() {
            return Err(Error::mapping(
                sqldb_core::MappingErrorKind::NoColumns,
                table.as_str(),
                format!("no columns to update in {table}"),
            ));
        }
        Ok(format!(
            "UPDATE {table} SET {} WHERE {}",
            sets.join(", "),
            conditions.join(" AND ")
        ))
    }
}
