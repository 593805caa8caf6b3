//! Core types and traits for sqldb.
//!
//! `sqldb-core` is the **contract layer** of the workspace. It defines the
//! data model and traits every other crate builds on.
//!
//! # Role In The Architecture
//!
//! - **Records**: [`Record`] is implemented by `#[derive(Record)]` and exposes
//!   table identity, column metadata, values and scan targets.
//! - **Values**: [`Value`] is the dynamically-typed SQL value; [`FromValue`],
//!   [`ScanValue`] and [`ToValue`] convert between values and Rust types.
//! - **Rows**: [`Rows`] is the streaming cursor contract and [`FromRow`]
//!   decodes one row into records, tuples, value lists or maps.
//! - **Drivers**: [`Driver`], [`Stmt`] and the listener traits are what a wire
//!   client implements to plug into sqldb.
//! - **Structured concurrency**: re-exports `Cx` and `Outcome` from
//!   asupersync; every driver-bound operation takes a `&Cx` and returns an
//!   `Outcome`.

pub use asupersync::{Cx, Outcome};

pub mod config;
pub mod driver;
pub mod error;
pub mod record;
pub mod row;
pub mod scan;
pub mod value;

pub use config::Config;
pub use driver::{
    Driver, DriverStats, IsolationLevel, ListenerConn, ListenerConnector, ListenerEvent,
    Notification, Stmt, TxOptions,
};
pub use error::{
    ConnectionError, ConnectionErrorKind, Error, MappingError, MappingErrorKind, QueryError,
    QueryErrorKind, Result, ScanError, TransactionError, TransactionErrorKind,
};
pub use record::{
    ColumnFilter, ColumnInfo, FieldInfo, FieldMapping, MappedColumn, Record, ScanTarget, Values,
    column_pointers_for, columns, columns_and_values, columns_field_indices_and_values,
    is_ignored, map_field, mapped_columns, primary_key_columns, scan_record, table_name,
};
pub use row::{FromRow, Rows, VecRows, check_columns};
pub use scan::{FromValue, Nullable, ScanValue};
pub use value::{ToValue, Value};

/// Conversion into an [`Outcome`], used by [`try_outcome!`].
pub trait IntoOutcome<T> {
    fn into_outcome(self) -> Outcome<T, Error>;
}

impl<T> IntoOutcome<T> for Outcome<T, Error> {
    fn into_outcome(self) -> Outcome<T, Error> {
        self
    }
}

impl<T> IntoOutcome<T> for Result<T> {
    fn into_outcome(self) -> Outcome<T, Error> {
        match self {
            Ok(v) => Outcome::Ok(v),
            Err(e) => Outcome::Err(e),
        }
    }
}

/// Unwrap an `Outcome` (or `Result`) or return early from the enclosing
/// function with the same non-`Ok` variant.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $crate::IntoOutcome::into_outcome($expr) {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}
