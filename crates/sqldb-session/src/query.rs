//! Context-aware statement helpers.
//!
//! These resolve the connection from a [`Ctx`], run the statement and
//! decode the result. Every error, including decode errors, is annotated
//! with the query and its formatted arguments.

use crate::context::Ctx;
use crate::conn::Connection;
use crate::scan::{for_each_row, scan_all, scan_all_into, scan_one};
use asupersync::{Cx, Outcome};
use sqldb_core::{Error, FromRow, FromValue, Result, Rows, Value, try_outcome};
use sqldb_query::wrap_error_with_query;
use std::collections::HashMap;
use std::sync::Arc;

fn annotate<T>(
    conn: &dyn Connection,
    outcome: Outcome<T, Error>,
    query: &str,
    args: &[Value],
) -> Outcome<T, Error> {
    match outcome {
        Outcome::Err(e) => Outcome::Err(wrap_error_with_query(e, query, args, conn.formatter())),
        other => other,
    }
}

async fn open(
    cx: &Cx,
    conn: &Arc<dyn Connection>,
    query: &str,
    args: &[Value],
) -> Outcome<Box<dyn Rows>, Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    conn.query(cx, query, args).await
}

/// Execute a statement and return the number of affected rows.
pub async fn exec(cx: &Cx, ctx: &Ctx, query: &str, args: &[Value]) -> Outcome<u64, Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    ctx.conn().exec(cx, query, args).await
}

/// Decode the first row of the result.
///
/// Fails with [`Error::NoRows`] when the result is empty.
pub async fn query_row<T: FromRow>(cx: &Cx, ctx: &Ctx, query: &str, args: &[Value]) -> Outcome<T, Error> {
    let conn = ctx.conn();
    let rows = try_outcome!(open(cx, &conn, query, args).await);
    annotate(conn.as_ref(), scan_one(cx, rows).await, query, args)
}

/// Like [`query_row`], returning `default` when the result is empty.
pub async fn query_row_or<T: FromRow>(
    cx: &Cx,
    ctx: &Ctx,
    default: T,
    query: &str,
    args: &[Value],
) -> Outcome<T, Error> {
    match query_row(cx, ctx, query, args).await {
        Outcome::Err(e) if e.is_no_rows() => Outcome::Ok(default),
        other => other,
    }
}

/// Decode the single column of the first row.
pub async fn query_value<T: FromValue>(cx: &Cx, ctx: &Ctx, query: &str, args: &[Value]) -> Outcome<T, Error> {
    let (value,) = try_outcome!(query_row::<(T,)>(cx, ctx, query, args).await);
    Outcome::Ok(value)
}

/// Like [`query_value`], returning `default` only when the result is
/// empty. Every other error is returned.
pub async fn query_value_or<T: FromValue>(
    cx: &Cx,
    ctx: &Ctx,
    default: T,
    query: &str,
    args: &[Value],
) -> Outcome<T, Error> {
    match query_value(cx, ctx, query, args).await {
        Outcome::Err(e) if e.is_no_rows() => Outcome::Ok(default),
        other => other,
    }
}

/// Decode every row of the result.
pub async fn query_rows<T: FromRow>(cx: &Cx, ctx: &Ctx, query: &str, args: &[Value]) -> Outcome<Vec<T>, Error> {
    let conn = ctx.conn();
    let rows = try_outcome!(open(cx, &conn, query, args).await);
    annotate(conn.as_ref(), scan_all(cx, rows).await, query, args)
}

/// Decode every row of the result into `dest`.
///
/// On cancellation `dest` holds the rows decoded so far.
pub async fn query_rows_into<T: FromRow>(
    cx: &Cx,
    ctx: &Ctx,
    dest: &mut Vec<T>,
    query: &str,
    args: &[Value],
) -> Outcome<(), Error> {
    let conn = ctx.conn();
    let rows = try_outcome!(open(cx, &conn, query, args).await);
    annotate(conn.as_ref(), scan_all_into(cx, rows, dest).await, query, args)
}

/// The first row as dynamically-typed values.
pub async fn query_row_as_values(cx: &Cx, ctx: &Ctx, query: &str, args: &[Value]) -> Outcome<Vec<Value>, Error> {
    query_row(cx, ctx, query, args).await
}

/// The first row rendered as strings. NULL becomes the empty string.
pub async fn query_row_as_strings(cx: &Cx, ctx: &Ctx, query: &str, args: &[Value]) -> Outcome<Vec<String>, Error> {
    query_row(cx, ctx, query, args).await
}

/// The first row keyed by column name.
pub async fn query_row_as_map(
    cx: &Cx,
    ctx: &Ctx,
    query: &str,
    args: &[Value],
) -> Outcome<HashMap<String, Value>, Error> {
    query_row(cx, ctx, query, args).await
}

/// Every row rendered as strings, preceded by a header row of column
/// names.
pub async fn query_rows_as_strings(
    cx: &Cx,
    ctx: &Ctx,
    query: &str,
    args: &[Value],
) -> Outcome<Vec<Vec<String>>, Error> {
    let conn = ctx.conn();
    let rows = try_outcome!(open(cx, &conn, query, args).await);
    let header = rows.columns().to_vec();
    let body: Vec<Vec<String>> = try_outcome!(annotate(conn.as_ref(), scan_all(cx, rows).await, query, args));
    let mut table = Vec::with_capacity(body.len() + 1);
    table.push(header);
    table.extend(body);
    Outcome::Ok(table)
}

/// Call `f` with every decoded row.
///
/// For tuple rows the arity is checked against the result's column count
/// before the first call. Iteration stops at the first error returned by
/// `f`.
pub async fn query_callback<T, F>(cx: &Cx, ctx: &Ctx, query: &str, args: &[Value], f: F) -> Outcome<(), Error>
where
    T: FromRow,
    F: FnMut(T) -> Result<()>,
{
    let conn = ctx.conn();
    let rows = try_outcome!(open(cx, &conn, query, args).await);
    annotate(conn.as_ref(), for_each_row(cx, rows, f).await, query, args)
}

/// Like [`query_callback`], also passing the cancellation context to `f`.
pub async fn query_callback_with_ctx<T, F>(
    cx: &Cx,
    ctx: &Ctx,
    query: &str,
    args: &[Value],
    mut f: F,
) -> Outcome<(), Error>
where
    T: FromRow,
    F: FnMut(&Cx, T) -> Result<()>,
{
    let conn = ctx.conn();
    let rows = try_outcome!(open(cx, &conn, query, args).await);
    annotate(
        conn.as_ref(),
        for_each_row(cx, rows, |row| f(cx, row)).await,
        query,
        args,
    )
}
