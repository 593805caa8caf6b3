//! sqldb: record-oriented PostgreSQL access.
//!
//! This facade re-exports the workspace crates:
//!
//! - [`sqldb_core`]: values, records, cursors, the driver contract and errors
//! - `#[derive(Record)]` from `sqldb-macros`
//! - [`sqldb_query`]: identifier checks, placeholders and statement building
//! - [`sqldb_session`]: connections, query helpers, record DML and transactions
//! - [`sqldb_notify`]: LISTEN/NOTIFY listeners
//! - [`mock`]: an in-memory driver for tests
//!
//! # Example
//!
//! ```ignore
//! use sqldb::prelude::*;
//!
//! #[derive(Debug, Default, Record)]
//! #[db(table = "users")]
//! struct User {
//!     #[db("id", pk)]
//!     id: i64,
//!     #[db("name")]
//!     name: String,
//! }
//!
//! let ctx = Ctx::new().with_conn(Arc::new(DbConn::from_url(driver, "postgres://localhost/app")?));
//! try_outcome!(insert_record(&cx, &ctx, &User { id: 1, name: "Alice".into() }, &[]).await);
//! let user: User = try_outcome!(read_record_by_pk(&cx, &ctx, &[Value::from(1)]).await);
//! ```
//!
//! The derive refers to `::sqldb_core`. Crates that only depend on `sqldb`
//! point it at the re-export instead:
//!
//! ```ignore
//! #[derive(Record)]
//! #[db(table = "users", crate = "sqldb::sqldb_core")]
//! struct User { /* ... */ }
//! ```

pub use sqldb_core;
pub use sqldb_core::*;
pub use sqldb_macros::Record;
pub use sqldb_notify::{
    ListenerHolder, ListenerRegistry, ListenerSettings, MIN_KEEPALIVE_INTERVAL,
    MIN_RECONNECT_INTERVAL, OnNotify, OnUnlisten,
};
pub use sqldb_query::{
    QueryBuilder, QueryFormatter, StdQueryBuilder, StdQueryFormatter, format_query, format_value,
    quote_literal, wrap_error_with_query,
};
pub use sqldb_session::*;
// Both globs bring a `scan` module; the row scanners are the public one.
pub use sqldb_session::scan;

pub use sqldb_mock as mock;
pub use sqldb_notify as notify;
pub use sqldb_query as query;
pub use sqldb_session as session;

/// The common imports for application code.
pub mod prelude {
    pub use crate::Record;
    pub use sqldb_core::{
        ColumnFilter, Config, Cx, Error, FromRow, FromValue, IsolationLevel, Nullable, Outcome,
        Result, ToValue, TxOptions, Value, Values, try_outcome,
    };
    pub use sqldb_session::{
        Connection, Ctx, DbConn, exec, insert, insert_record, insert_records, insert_unique,
        insert_unique_record, isolated_transaction, query_callback, query_row, query_row_or,
        query_rows, query_value, query_value_or, read_record_by_pk, read_record_by_pk_or,
        serialized_transaction, transaction, transaction_opts, transaction_read_only,
        transaction_savepoint, update, update_record, update_records, upsert_record,
        upsert_records,
    };
    pub use std::sync::Arc;
}
