//! Connections, record DML and transactions for sqldb.
//!
//! A [`Ctx`] carries the connection every operation runs on. Outside a
//! transaction it holds a plain [`DbConn`]; inside [`transaction`] and its
//! variants it holds the transaction handle, so code written against a
//! context runs unchanged whether or not a transaction is open.
//!
//! # Design Philosophy
//!
//! - **Context carriage**: Operations take the connection from the context,
//!   falling back to the process-wide connection
//! - **Pass-through nesting**: A transaction requested inside a transaction
//!   joins the enclosing one
//! - **Errors carry their query**: Every driver error is annotated with
//!   the statement that produced it
//! - **Cursors always close**: Scanning closes the cursor on every path
//! - **Cancel-correct**: Every async operation takes `&Cx` and returns an
//!   `Outcome`
//!
//! # Example
//!
//! ```ignore
//! let ctx = Ctx::new().with_conn(Arc::new(DbConn::from_url(driver, url)?));
//!
//! transaction(&cx, &ctx, |ctx| async move {
//!     try_outcome!(insert_record(&cx, &ctx, &user, &[]).await);
//!     try_outcome!(exec(&cx, &ctx, "UPDATE stats SET users = users + 1", &[]).await);
//!     Outcome::Ok(())
//! })
//! .await;
//!
//! let users: Vec<User> = try_outcome!(query_rows(&cx, &ctx, "SELECT * FROM users", &[]).await);
//! ```

pub mod cache;
pub mod conn;
pub mod context;
pub mod dml;
pub mod listen;
pub mod query;
pub mod scan;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use cache::{CacheKey, CachedStatement, QueryCache, StatementKind};
pub use conn::{Connection, DbConn, ErrConn, TxInfo};
pub use context::{Ctx, conn, context_with_conn, global_conn, set_global_conn};
pub use dml::{
    PreparedInsertUnique, PreparedReadByPk, PreparedRecordExec, insert, insert_record, insert_records,
    insert_unique, insert_unique_record, prepare_insert_record, prepare_insert_unique_record,
    prepare_read_record_by_pk, prepare_update_record, prepare_upsert_record, read_record_by_pk,
    read_record_by_pk_or, update, update_record, update_records, upsert_record, upsert_records,
};
pub use listen::{is_listening_on_channel, listen_on_channel, notify, unlisten_channel};
pub use query::{
    exec, query_callback, query_callback_with_ctx, query_row, query_row_as_map, query_row_as_strings,
    query_row_as_values, query_row_or, query_rows, query_rows_as_strings, query_rows_into, query_value,
    query_value_or,
};
pub use scan::{for_each_row, scan_all, scan_all_into, scan_one};
pub use transaction::{
    DEFAULT_SERIALIZED_TRANSACTION_RETRIES, check_tx_options_compatibility, is_transaction,
    isolated_transaction, next_transaction_serial, serialized_transaction, serialized_transaction_retries,
    set_serialized_transaction_retries, transaction, transaction_opts, transaction_read_only,
    transaction_savepoint,
};
