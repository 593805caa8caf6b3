//! Draining cursors into Rust values.
//!
//! Every helper closes the cursor on all paths and checks for
//! cancellation before each row.

use asupersync::{Cx, Outcome};
use sqldb_core::{Error, FromRow, Result, Rows, check_columns};

/// Close `rows`; a close failure replaces a successful result.
async fn finish<T>(cx: &Cx, mut rows: Box<dyn Rows>, outcome: Outcome<T, Error>) -> Outcome<T, Error> {
    let closed = rows.close(cx).await;
    match (outcome, closed) {
        (Outcome::Ok(_), Err(e)) => Outcome::Err(e),
        (outcome, Err(e)) => {
            tracing::debug!(error = %e, "Ignoring cursor close failure after error");
            outcome
        }
        (outcome, Ok(())) => outcome,
    }
}

async fn next_row<T: FromRow>(cx: &Cx, rows: &mut dyn Rows) -> Outcome<Option<T>, Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    if !rows.next(cx).await {
        return match rows.err() {
            Some(e) => Outcome::Err(e),
            None => Outcome::Ok(None),
        };
    }
    let Some(values) = rows.values() else {
        return Outcome::Ok(None);
    };
    match T::from_row(rows.columns(), values) {
        Ok(row) => Outcome::Ok(Some(row)),
        Err(e) => Outcome::Err(e),
    }
}

/// Decode the first row of `rows`, failing with [`Error::NoRows`] when
/// there is none. Remaining rows are discarded.
pub async fn scan_one<T: FromRow>(cx: &Cx, mut rows: Box<dyn Rows>) -> Outcome<T, Error> {
    let outcome = match next_row::<T>(cx, rows.as_mut()).await {
        Outcome::Ok(Some(row)) => Outcome::Ok(row),
        Outcome::Ok(None) => Outcome::Err(Error::NoRows),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    };
    finish(cx, rows, outcome).await
}

/// Decode every row of `rows` into `dest`.
///
/// On success `dest` holds exactly the decoded rows. On cancellation it
/// holds the rows decoded so far; on any other failure it is left
/// untouched.
pub async fn scan_all_into<T: FromRow>(
    cx: &Cx,
    mut rows: Box<dyn Rows>,
    dest: &mut Vec<T>,
) -> Outcome<(), Error> {
    let mut collected = Vec::new();
    let outcome = loop {
        match next_row::<T>(cx, rows.as_mut()).await {
            Outcome::Ok(Some(row)) => collected.push(row),
            Outcome::Ok(None) => {
                *dest = collected;
                break Outcome::Ok(());
            }
            Outcome::Cancelled(reason) => {
                *dest = collected;
                break Outcome::Cancelled(reason);
            }
            Outcome::Err(e) => break Outcome::Err(e),
            Outcome::Panicked(p) => break Outcome::Panicked(p),
        }
    };
    finish(cx, rows, outcome).await
}

/// Decode every row of `rows`.
pub async fn scan_all<T: FromRow>(cx: &Cx, rows: Box<dyn Rows>) -> Outcome<Vec<T>, Error> {
    let mut out = Vec::new();
    match scan_all_into(cx, rows, &mut out).await {
        Outcome::Ok(()) => Outcome::Ok(out),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Call `f` for every decoded row, stopping at the first error.
///
/// The column count is checked against `T` before the first row is read.
pub async fn for_each_row<T, F>(cx: &Cx, mut rows: Box<dyn Rows>, mut f: F) -> Outcome<(), Error>
where
    T: FromRow,
    F: FnMut(T) -> Result<()>,
{
    if let Err(e) = check_columns::<T>(rows.columns()) {
        return finish(cx, rows, Outcome::Err(e)).await;
    }
    let outcome = loop {
        match next_row::<T>(cx, rows.as_mut()).await {
            Outcome::Ok(Some(row)) => {
                if let Err(e) = f(row) {
                    break Outcome::Err(e);
                }
            }
            Outcome::Ok(None) => break Outcome::Ok(()),
            Outcome::Err(e) => break Outcome::Err(e),
            Outcome::Cancelled(r) => break Outcome::Cancelled(r),
            Outcome::Panicked(p) => break Outcome::Panicked(p),
        }
    };
    finish(cx, rows, outcome).await
}
