//! Row cursors and per-row decoding.

use crate::error::{Error, Result};
use crate::record::{Record, scan_record};
use crate::scan::{FromValue, ScanValue};
use crate::value::Value;
use asupersync::Cx;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A single-pass cursor over a query result.
///
/// `columns()` is stable for the cursor's lifetime. `values()` and `scan()`
/// refer to the row made current by the last successful `next()`. When
/// `next()` returns `false` the cursor is exhausted or failed; `err()`
/// tells the two apart and stays meaningful after `close()`.
#[async_trait]
pub trait Rows: Send {
    /// Result column names.
    fn columns(&self) -> &[String];

    /// Advance to the next row.
    async fn next(&mut self, cx: &Cx) -> bool;

    /// The current row, if any.
    fn values(&self) -> Option<&[Value]>;

    /// Terminal error, if iteration failed.
    fn err(&self) -> Option<Error>;

    /// Release the cursor. Calling this more than once is a no-op.
    async fn close(&mut self, cx: &Cx) -> Result<()>;

    /// Copy the current row into positional destinations.
    fn scan(&self, dests: &mut [&mut dyn ScanValue]) -> Result<()> {
        let Some(values) = self.values() else {
            return Err(Error::custom("scan called without a current row"));
        };
        if dests.len() != values.len() {
            return Err(Error::column_count(dests.len(), values.len()));
        }
        let columns = self.columns();
        for (i, (dest, value)) in dests.iter_mut().zip(values).enumerate() {
            dest.scan_value(value).map_err(|e| match columns.get(i) {
                Some(name) => e.in_column(name),
                None => e,
            })?;
        }
        Ok(())
    }
}

// ============================================================================
// In-memory cursor
// ============================================================================

/// A cursor over rows held in memory.
///
/// Used by the mock driver and handy for drivers that buffer whole result
/// sets. An optional terminal error is reported once the rows are drained.
#[derive(Debug, Default)]
pub struct VecRows {
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
    current: Option<Vec<Value>>,
    terminal_error: Option<Error>,
    failed: bool,
    closed: bool,
    close_counter: Option<Arc<AtomicUsize>>,
}

impl VecRows {
    pub fn new<S: Into<String>>(
        columns: impl IntoIterator<Item = S>,
        rows: Vec<Vec<Value>>,
    ) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: rows.into(),
            ..Self::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Fail with `err` after the buffered rows have been returned.
    pub fn with_error(mut self, err: Error) -> Self {
        self.terminal_error = Some(err);
        self
    }

    /// Count closes in `counter`. Repeated closes are counted once.
    pub fn with_close_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.close_counter = Some(counter);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl Rows for VecRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next(&mut self, _cx: &Cx) -> bool {
        if self.closed || self.failed {
            self.current = None;
            return false;
        }
        if let Some(row) = self.rows.pop_front() {
            self.current = Some(row);
            return true;
        }
        self.current = None;
        if self.terminal_error.is_some() {
            self.failed = true;
        }
        false
    }

    fn values(&self) -> Option<&[Value]> {
        self.current.as_deref()
    }

    fn err(&self) -> Option<Error> {
        if self.failed {
            self.terminal_error.clone()
        } else {
            None
        }
    }

    async fn close(&mut self, _cx: &Cx) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.current = None;
            self.rows.clear();
            if let Some(counter) = &self.close_counter {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Row decoding
// ============================================================================

/// Decode one result row into `Self`.
///
/// Implemented for:
/// - every `Record + Default` type (columns resolved by name),
/// - tuples of [`FromValue`] types (positional, arity checked),
/// - `Vec<Value>` (the row as dynamically-typed values),
/// - `Vec<String>` (the row rendered as plain strings),
/// - `HashMap<String, Value>` (column name to value).
pub trait FromRow: Sized {
    /// Number of columns this type consumes, when fixed.
    fn expected_columns() -> Option<usize> {
        None
    }

    fn from_row(columns: &[String], values: &[Value]) -> Result<Self>;
}

/// Check a cursor's column count against `T` before iterating.
pub fn check_columns<T: FromRow>(columns: &[String]) -> Result<()> {
    match T::expected_columns() {
        Some(expected) if expected != columns.len() => {
            Err(Error::column_count(expected, columns.len()))
        }
        _ => Ok(()),
    }
}

impl<T: Record + Default> FromRow for T {
    fn from_row(columns: &[String], values: &[Value]) -> Result<Self> {
        let mut record = T::default();
        scan_record(&mut record, columns, values)?;
        Ok(record)
    }
}

impl FromRow for Vec<Value> {
    fn from_row(_columns: &[String], values: &[Value]) -> Result<Self> {
        Ok(values.to_vec())
    }
}

impl FromRow for Vec<String> {
    fn from_row(_columns: &[String], values: &[Value]) -> Result<Self> {
        Ok(values.iter().map(Value::to_plain_string).collect())
    }
}

impl FromRow for HashMap<String, Value> {
    fn from_row(columns: &[String], values: &[Value]) -> Result<Self> {
        Ok(columns.iter().cloned().zip(values.iter().cloned()).collect())
    }
}

macro_rules! impl_from_row_tuple {
    ($count:expr; $($name:ident $idx:tt),+) => {
        impl<$($name: FromValue),+> FromRow for ($($name,)+) {
            fn expected_columns() -> Option<usize> {
                Some($count)
            }

            fn from_row(columns: &[String], values: &[Value]) -> Result<Self> {
                if values.len() != $count {
                    return Err(Error::column_count($count, values.len()));
                }
                let column = |i: usize| columns.get(i).map_or("", String::as_str);
                Ok(($(
                    $name::from_value(&values[$idx]).map_err(|e| e.in_column(column($idx)))?,
                )+))
            }
        }
    };
}

impl_from_row_tuple!(1; A 0);
impl_from_row_tuple!(2; A 0, B 1);
impl_from_row_tuple!(3; A 0, B 1, C 2);
impl_from_row_tuple!(4; A 0, B 1, C 2, D 3);
impl_from_row_tuple!(5; A 0, B 1, C 2, D 3, E 4);
impl_from_row_tuple!(6; A 0, B 1, C 2, D 3, E 4, F 5);
impl_from_row_tuple!(7; A 0, B 1, C 2, D 3, E 4, F 5, G 6);
impl_from_row_tuple!(8; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::User;
    use asupersync::runtime::RuntimeBuilder;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_tuple_from_row() {
        let columns = cols(&["id", "name"]);
        let row = vec![Value::BigInt(1), Value::Text("Alice".into())];
        let (id, name): (i64, String) = FromRow::from_row(&columns, &row).unwrap();
        assert_eq!(id, 1);
        assert_eq!(name, "Alice");

        assert_eq!(<(String,)>::expected_columns(), Some(1));
        let err = check_columns::<(String,)>(&columns).unwrap_err();
        assert!(err.to_string().contains("arguments but query result has"));
    }

    #[test]
    fn test_record_from_row() {
        let columns = cols(&["id", "name", "created_by"]);
        let row = vec![
            Value::BigInt(7),
            Value::Text("Bob".into()),
            Value::Text("admin".into()),
        ];
        let user = User::from_row(&columns, &row).unwrap();
        assert_eq!(user.id, 7);
        assert_eq!(user.name, "Bob");
        assert_eq!(user.audit.created_by, "admin");
        assert_eq!(User::expected_columns(), None);
    }

    #[test]
    fn test_dynamic_rows() {
        let columns = cols(&["a", "b"]);
        let row = vec![Value::Null, Value::Bytes(b"x".to_vec())];
        assert_eq!(Vec::<Value>::from_row(&columns, &row).unwrap(), row);
        assert_eq!(
            Vec::<String>::from_row(&columns, &row).unwrap(),
            vec![String::new(), "x".to_string()]
        );
        let map = HashMap::<String, Value>::from_row(&columns, &row).unwrap();
        assert_eq!(map.get("a"), Some(&Value::Null));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_vec_rows_cursor() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let closes = Arc::new(AtomicUsize::new(0));

        rt.block_on(async {
            let mut rows = VecRows::new(["id"], vec![vec![Value::BigInt(1)]])
                .with_error(Error::custom("boom"))
                .with_close_counter(closes.clone());

            assert!(rows.err().is_none());
            assert!(rows.next(&cx).await);
            let mut id = 0_i64;
            rows.scan(&mut [&mut id]).unwrap();
            assert_eq!(id, 1);

            assert!(!rows.next(&cx).await);
            assert!(rows.values().is_none());
            assert!(rows.err().is_some());

            rows.close(&cx).await.unwrap();
            rows.close(&cx).await.unwrap();
            assert!(rows.err().is_some());
        });
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scan_count_mismatch() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        rt.block_on(async {
            let mut rows = VecRows::new(["a", "b"], vec![vec![Value::BigInt(1), Value::BigInt(2)]]);
            assert!(rows.next(&cx).await);
            let mut a = 0_i64;
            let err = rows.scan(&mut [&mut a]).unwrap_err();
            assert!(err.to_string().contains("arguments but query result has 2"));
        });
    }
}
