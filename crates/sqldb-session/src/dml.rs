//! Record and values-map DML.
//!
//! Statements are generated by the connection's [`QueryBuilder`] and
//! cached per record type in [`QueryCache::global`]. Read-only columns are
//! never written: every write adds [`ColumnFilter::IgnoreReadOnly`] in
//! front of the caller's filters.
//!
//! [`QueryBuilder`]: sqldb_query::QueryBuilder

use crate::cache::{CacheKey, CachedStatement, QueryCache, StatementKind};
use crate::conn::Connection;
use crate::context::Ctx;
use crate::query::query_row;
use crate::transaction::transaction;
use asupersync::{Cx, Outcome};
use sqldb_core::{
    ColumnFilter, ColumnInfo, Error, MappingErrorKind, Record, Result, Rows, Stmt, Value, Values,
    columns, columns_and_values, is_ignored, primary_key_columns, table_name, try_outcome,
};
use sqldb_query::{QueryBuilder, wrap_error_with_query};
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

// ============================================================================
// Statement generation
// ============================================================================

fn write_filters(filters: &[ColumnFilter]) -> Vec<ColumnFilter> {
    let mut all = Vec::with_capacity(filters.len() + 1);
    all.push(ColumnFilter::IgnoreReadOnly);
    all.extend_from_slice(filters);
    all
}

fn requires_primary_key(kind: &StatementKind) -> bool {
    matches!(
        kind,
        StatementKind::Upsert | StatementKind::Update | StatementKind::SelectByPk
    )
}

fn build_statement(
    builder: &dyn QueryBuilder,
    table: &str,
    kind: &StatementKind,
    columns: Vec<ColumnInfo>,
) -> Result<CachedStatement> {
    let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
    let query = match kind {
        StatementKind::Insert => builder.insert(table, &names)?,
        StatementKind::InsertUnique { on_conflict } => {
            builder.insert_unique(table, &names, on_conflict)?
        }
        StatementKind::Upsert => builder.upsert(table, &columns)?,
        StatementKind::Update => builder.update_columns_by_pk(table, &columns)?,
        StatementKind::SelectByPk => builder.select_by_pk(table, &names)?,
    };
    Ok(CachedStatement::new(query, columns))
}

fn cached<R: Record + 'static>(
    conn: &dyn Connection,
    kind: StatementKind,
    filters: &[ColumnFilter],
    columns: impl FnOnce() -> Vec<ColumnInfo>,
) -> Result<Arc<CachedStatement>> {
    let table = table_name::<R>()?;
    if requires_primary_key(&kind) && primary_key_columns::<R>().is_empty() {
        return Err(Error::no_primary_key(type_name::<R>()));
    }
    let builder = conn.query_builder();
    let key = CacheKey::new::<R>(kind.clone(), filters, &builder.dialect());
    QueryCache::global().get_or_build(key, || build_statement(builder, table, &kind, columns()))
}

/// Statement and arguments for writing `record`.
fn record_statement<R: Record + 'static>(
    conn: &dyn Connection,
    kind: StatementKind,
    filters: &[ColumnFilter],
    record: &R,
) -> Result<(Arc<CachedStatement>, Vec<Value>)> {
    let (columns, values) = columns_and_values(record, filters);
    let statement = cached::<R>(conn, kind, filters, || columns)?;
    Ok((statement, values))
}

/// Statement for any record of type `R`, for preparing ahead of time.
fn type_statement<R: Record + 'static>(
    conn: &dyn Connection,
    kind: StatementKind,
    filters: &[ColumnFilter],
) -> Result<Arc<CachedStatement>> {
    if filters.iter().any(ColumnFilter::depends_on_value) {
        return Err(Error::custom(
            "value-dependent column filters cannot be used with prepared statements",
        ));
    }
    cached::<R>(conn, kind, filters, || {
        columns::<R>()
            .into_iter()
            .filter(|c| !is_ignored(filters, c, &Value::Null))
            .collect()
    })
}

fn pk_statement<R: Record + 'static>(conn: &dyn Connection, pk: Option<&[Value]>) -> Result<Arc<CachedStatement>> {
    let pk_columns = primary_key_columns::<R>();
    if let Some(pk) = pk {
        if !pk_columns.is_empty() && pk.len() != pk_columns.len() {
            return Err(Error::mapping(
                MappingErrorKind::ColumnCount,
                type_name::<R>(),
                format!(
                    "{} has {} primary key columns but {} values were given",
                    type_name::<R>(),
                    pk_columns.len(),
                    pk.len()
                ),
            ));
        }
    }
    cached::<R>(conn, StatementKind::SelectByPk, &[], || pk_columns)
}

/// Whether `rows` produced a row; the cursor is always closed.
async fn returned_row(
    cx: &Cx,
    mut rows: Box<dyn Rows>,
    conn: &dyn Connection,
    query: &str,
    args: &[Value],
) -> Outcome<bool, Error> {
    let found = rows.next(cx).await;
    let err = rows.err();
    let closed = rows.close(cx).await;
    if let Some(e) = err.or(closed.err()) {
        return Outcome::Err(wrap_error_with_query(e, query, args, conn.formatter()));
    }
    Outcome::Ok(found)
}

async fn exec_statement(
    cx: &Cx,
    conn: &dyn Connection,
    statement: &CachedStatement,
    args: &[Value],
) -> Outcome<u64, Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    conn.exec(cx, &statement.query, args).await
}

// ============================================================================
// Record DML
// ============================================================================

/// Insert `record` into its table.
#[tracing::instrument(level = "debug", skip_all, fields(record = type_name::<R>()))]
pub async fn insert_record<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    record: &R,
    filters: &[ColumnFilter],
) -> Outcome<(), Error> {
    let conn = ctx.conn();
    let filters = write_filters(filters);
    let (statement, values) = try_outcome!(record_statement(conn.as_ref(), StatementKind::Insert, &filters, record));
    try_outcome!(exec_statement(cx, conn.as_ref(), &statement, &values).await);
    Outcome::Ok(())
}

/// Insert `record` unless it conflicts on `on_conflict`.
///
/// Returns whether a row was inserted.
#[tracing::instrument(level = "debug", skip_all, fields(record = type_name::<R>()))]
pub async fn insert_unique_record<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    record: &R,
    on_conflict: &str,
    filters: &[ColumnFilter],
) -> Outcome<bool, Error> {
    let conn = ctx.conn();
    let filters = write_filters(filters);
    let kind = StatementKind::InsertUnique {
        on_conflict: on_conflict.to_string(),
    };
    let (statement, values) = try_outcome!(record_statement(conn.as_ref(), kind, &filters, record));
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    let rows = try_outcome!(conn.query(cx, &statement.query, &values).await);
    returned_row(cx, rows, conn.as_ref(), &statement.query, &values).await
}

/// Insert `record`, or update its non-key columns when a row with the same
/// primary key exists.
#[tracing::instrument(level = "debug", skip_all, fields(record = type_name::<R>()))]
pub async fn upsert_record<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    record: &R,
    filters: &[ColumnFilter],
) -> Outcome<(), Error> {
    let conn = ctx.conn();
    let filters = write_filters(filters);
    let (statement, values) = try_outcome!(record_statement(conn.as_ref(), StatementKind::Upsert, &filters, record));
    try_outcome!(exec_statement(cx, conn.as_ref(), &statement, &values).await);
    Outcome::Ok(())
}

/// Update the non-key columns of the row identified by `record`'s primary
/// key.
#[tracing::instrument(level = "debug", skip_all, fields(record = type_name::<R>()))]
pub async fn update_record<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    record: &R,
    filters: &[ColumnFilter],
) -> Outcome<(), Error> {
    let conn = ctx.conn();
    let filters = write_filters(filters);
    let (statement, values) = try_outcome!(record_statement(conn.as_ref(), StatementKind::Update, &filters, record));
    try_outcome!(exec_statement(cx, conn.as_ref(), &statement, &values).await);
    Outcome::Ok(())
}

/// Read the row with primary key `pk`.
///
/// Fails with [`Error::NoRows`] when there is none.
pub async fn read_record_by_pk<R: Record + Default + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    pk: &[Value],
) -> Outcome<R, Error> {
    let conn = ctx.conn();
    let statement = try_outcome!(pk_statement::<R>(conn.as_ref(), Some(pk)));
    query_row(cx, &ctx.with_conn(conn), &statement.query, pk).await
}

/// Like [`read_record_by_pk`], returning `default` when there is no such
/// row.
pub async fn read_record_by_pk_or<R: Record + Default + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    default: R,
    pk: &[Value],
) -> Outcome<R, Error> {
    match read_record_by_pk(cx, ctx, pk).await {
        Outcome::Err(e) if e.is_no_rows() => Outcome::Ok(default),
        other => other,
    }
}

// ============================================================================
// Values-map DML
// ============================================================================

/// Insert a row given as column values. Columns are listed sorted by name.
pub async fn insert(cx: &Cx, ctx: &Ctx, table: &str, values: &Values) -> Outcome<(), Error> {
    let conn = ctx.conn();
    let (columns, args) = values.sorted_columns_and_values();
    let query = try_outcome!(conn.query_builder().insert(table, &columns));
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    try_outcome!(conn.exec(cx, &query, &args).await);
    Outcome::Ok(())
}

/// Insert a row unless it conflicts on `on_conflict`; returns whether a
/// row was inserted.
pub async fn insert_unique(
    cx: &Cx,
    ctx: &Ctx,
    table: &str,
    values: &Values,
    on_conflict: &str,
) -> Outcome<bool, Error> {
    let conn = ctx.conn();
    let (columns, args) = values.sorted_columns_and_values();
    let query = try_outcome!(conn.query_builder().insert_unique(table, &columns, on_conflict));
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    let rows = try_outcome!(conn.query(cx, &query, &args).await);
    returned_row(cx, rows, conn.as_ref(), &query, &args).await
}

/// Update the rows matching `where_clause`.
///
/// `where_clause` uses placeholders `$1..$n` for `where_args`; the SET
/// placeholders continue after them. Returns the number of affected rows.
pub async fn update(
    cx: &Cx,
    ctx: &Ctx,
    table: &str,
    values: &Values,
    where_clause: &str,
    where_args: &[Value],
) -> Outcome<u64, Error> {
    let conn = ctx.conn();
    let (query, args) = try_outcome!(conn.query_builder().update_values(table, values, where_clause, where_args));
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    conn.exec(cx, &query, &args).await
}

// ============================================================================
// Prepared record statements
// ============================================================================

async fn prepare_statement(
    cx: &Cx,
    conn: &dyn Connection,
    statement: &CachedStatement,
) -> Outcome<Box<dyn Stmt>, Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    conn.prepare(cx, &statement.query).await
}

/// A prepared insert, upsert or update for records of type `R`.
///
/// Call [`PreparedRecordExec::close`] when done.
pub struct PreparedRecordExec<R> {
    stmt: Box<dyn Stmt>,
    filters: Vec<ColumnFilter>,
    _record: PhantomData<fn(&R)>,
}

impl<R> fmt::Debug for PreparedRecordExec<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedRecordExec")
            .field("query", &self.stmt.query_text())
            .finish_non_exhaustive()
    }
}

impl<R: Record> PreparedRecordExec<R> {
    pub fn query(&self) -> &str {
        self.stmt.query_text()
    }

    /// Execute the statement for `record`.
    pub async fn exec(&self, cx: &Cx, record: &R) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let (_, values) = columns_and_values(record, &self.filters);
        try_outcome!(self.stmt.exec(cx, &values).await);
        Outcome::Ok(())
    }

    pub async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        self.stmt.close(cx).await
    }
}

async fn prepare_record_exec<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    kind: StatementKind,
    filters: &[ColumnFilter],
) -> Outcome<PreparedRecordExec<R>, Error> {
    let conn = ctx.conn();
    let filters = write_filters(filters);
    let statement = try_outcome!(type_statement::<R>(conn.as_ref(), kind, &filters));
    let stmt = try_outcome!(prepare_statement(cx, conn.as_ref(), &statement).await);
    Outcome::Ok(PreparedRecordExec {
        stmt,
        filters,
        _record: PhantomData,
    })
}

/// Prepare an insert for records of type `R`.
pub async fn prepare_insert_record<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    filters: &[ColumnFilter],
) -> Outcome<PreparedRecordExec<R>, Error> {
    prepare_record_exec(cx, ctx, StatementKind::Insert, filters).await
}

/// Prepare an upsert for records of type `R`.
pub async fn prepare_upsert_record<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    filters: &[ColumnFilter],
) -> Outcome<PreparedRecordExec<R>, Error> {
    prepare_record_exec(cx, ctx, StatementKind::Upsert, filters).await
}

/// Prepare an update-by-primary-key for records of type `R`.
pub async fn prepare_update_record<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    filters: &[ColumnFilter],
) -> Outcome<PreparedRecordExec<R>, Error> {
    prepare_record_exec(cx, ctx, StatementKind::Update, filters).await
}

/// A prepared conflict-ignoring insert for records of type `R`.
pub struct PreparedInsertUnique<R> {
    inner: PreparedRecordExec<R>,
    conn: Arc<dyn Connection>,
}

impl<R> fmt::Debug for PreparedInsertUnique<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PreparedInsertUnique")
            .field(&self.inner)
            .finish()
    }
}

impl<R: Record> PreparedInsertUnique<R> {
    pub fn query(&self) -> &str {
        self.inner.query()
    }

    /// Insert `record`; returns whether a row was inserted.
    pub async fn insert(&self, cx: &Cx, record: &R) -> Outcome<bool, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let (_, values) = columns_and_values(record, &self.inner.filters);
        let rows = try_outcome!(self.inner.stmt.query(cx, &values).await);
        returned_row(cx, rows, self.conn.as_ref(), self.query(), &values).await
    }

    pub async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        self.inner.close(cx).await
    }
}

/// Prepare a conflict-ignoring insert for records of type `R`.
pub async fn prepare_insert_unique_record<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    on_conflict: &str,
    filters: &[ColumnFilter],
) -> Outcome<PreparedInsertUnique<R>, Error> {
    let kind = StatementKind::InsertUnique {
        on_conflict: on_conflict.to_string(),
    };
    let inner = try_outcome!(prepare_record_exec(cx, ctx, kind, filters).await);
    Outcome::Ok(PreparedInsertUnique {
        inner,
        conn: ctx.conn(),
    })
}

/// A prepared read-by-primary-key for records of type `R`.
pub struct PreparedReadByPk<R> {
    stmt: Box<dyn Stmt>,
    pk_count: usize,
    conn: Arc<dyn Connection>,
    _record: PhantomData<fn() -> R>,
}

impl<R> fmt::Debug for PreparedReadByPk<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedReadByPk")
            .field("query", &self.stmt.query_text())
            .field("pk_count", &self.pk_count)
            .finish_non_exhaustive()
    }
}

impl<R: Record + Default> PreparedReadByPk<R> {
    pub fn query(&self) -> &str {
        self.stmt.query_text()
    }

    /// Read the row with primary key `pk`; [`Error::NoRows`] when absent.
    pub async fn read(&self, cx: &Cx, pk: &[Value]) -> Outcome<R, Error> {
        if pk.len() != self.pk_count {
            return Outcome::Err(Error::column_count(self.pk_count, pk.len()));
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let rows = try_outcome!(self.stmt.query(cx, pk).await);
        match crate::scan::scan_one(cx, rows).await {
            Outcome::Err(e) => Outcome::Err(wrap_error_with_query(e, self.query(), pk, self.conn.formatter())),
            other => other,
        }
    }

    pub async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        self.stmt.close(cx).await
    }
}

/// Prepare a read-by-primary-key for records of type `R`.
pub async fn prepare_read_record_by_pk<R: Record + Default + 'static>(
    cx: &Cx,
    ctx: &Ctx,
) -> Outcome<PreparedReadByPk<R>, Error> {
    let conn = ctx.conn();
    let statement = try_outcome!(pk_statement::<R>(conn.as_ref(), None));
    let stmt = try_outcome!(prepare_statement(cx, conn.as_ref(), &statement).await);
    Outcome::Ok(PreparedReadByPk {
        stmt,
        pk_count: statement.columns.len(),
        conn,
        _record: PhantomData,
    })
}

// ============================================================================
// Batches
// ============================================================================

/// Close `stmt`; a close failure replaces a successful result.
async fn close_after<R: Record, T>(
    cx: &Cx,
    stmt: &PreparedRecordExec<R>,
    outcome: Outcome<T, Error>,
) -> Outcome<T, Error> {
    let closed = stmt.close(cx).await;
    match (outcome, closed) {
        (Outcome::Ok(_), Outcome::Err(e)) => Outcome::Err(e),
        (outcome, _) => outcome,
    }
}

async fn exec_each<R: Record>(cx: &Cx, stmt: &PreparedRecordExec<R>, records: &[R]) -> Outcome<(), Error> {
    for record in records {
        try_outcome!(stmt.exec(cx, record).await);
    }
    Outcome::Ok(())
}

async fn run_batch<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    kind: StatementKind,
    records: &[R],
    filters: &[ColumnFilter],
) -> Outcome<(), Error> {
    match records {
        [] => return Outcome::Ok(()),
        [record] => {
            return match kind {
                StatementKind::Upsert => upsert_record(cx, ctx, record, filters).await,
                StatementKind::Update => update_record(cx, ctx, record, filters).await,
                _ => insert_record(cx, ctx, record, filters).await,
            };
        }
        _ => {}
    }
    tracing::debug!(
        record = type_name::<R>(),
        count = records.len(),
        kind = ?kind,
        "Writing record batch"
    );

    transaction(cx, ctx, |tx_ctx| async move {
        // Value-dependent filters give every record its own column set.
        if filters.iter().any(ColumnFilter::depends_on_value) {
            for record in records {
                let outcome = match kind {
                    StatementKind::Upsert => upsert_record(cx, &tx_ctx, record, filters).await,
                    StatementKind::Update => update_record(cx, &tx_ctx, record, filters).await,
                    _ => insert_record(cx, &tx_ctx, record, filters).await,
                };
                try_outcome!(outcome);
            }
            return Outcome::Ok(());
        }
        let stmt = try_outcome!(prepare_record_exec::<R>(cx, &tx_ctx, kind, filters).await);
        let outcome = exec_each(cx, &stmt, records).await;
        close_after(cx, &stmt, outcome).await
    })
    .await
}

/// Insert every record, in a single transaction when there is more than
/// one.
pub async fn insert_records<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    records: &[R],
    filters: &[ColumnFilter],
) -> Outcome<(), Error> {
    run_batch(cx, ctx, StatementKind::Insert, records, filters).await
}

/// Upsert every record, in a single transaction when there is more than
/// one.
pub async fn upsert_records<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    records: &[R],
    filters: &[ColumnFilter],
) -> Outcome<(), Error> {
    run_batch(cx, ctx, StatementKind::Upsert, records, filters).await
}

/// Update every record by primary key, in a single transaction when there
/// is more than one.
pub async fn update_records<R: Record + 'static>(
    cx: &Cx,
    ctx: &Ctx,
    records: &[R],
    filters: &[ColumnFilter],
) -> Outcome<(), Error> {
    run_batch(cx, ctx, StatementKind::Update, records, filters).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::DbConn;
    use crate::testing::{block_on, mock_ctx, unwrap_outcome};
    use sqldb_core::Config;
    use sqldb_macros::Record;
    use sqldb_mock::{CallKind, MockDriver};
    use sqldb_query::{QueryFormatter, StdQueryFormatter};

    #[derive(Debug, Default, Clone, PartialEq, Record)]
    #[db(table = "dml_users")]
    struct User {
        #[db("id", pk)]
        id: i64,
        #[db("name")]
        name: String,
        #[db("active")]
        active: bool,
        #[db("created_at", readonly)]
        created_at: Option<String>,
    }

    #[derive(Debug, Default, Clone, Record)]
    #[db(table = "dml_logs")]
    struct LogLine {
        #[db("message")]
        message: String,
    }

    #[derive(Debug, Default, Clone, Record)]
    #[db(table = "dml_tags")]
    struct Tag {
        #[db("tag", pk)]
        tag: String,
    }

    fn ann() -> User {
        User {
            id: 1,
            name: "ann".to_string(),
            active: true,
            created_at: None,
        }
    }

    #[test]
    fn test_insert_skips_read_only_columns() {
        let (driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            unwrap_outcome(insert_record(&cx, &ctx, &ann(), &[]).await);
        });
        let call = driver.last_call(CallKind::Exec).unwrap();
        assert_eq!(call.query, "INSERT INTO dml_users(id,name,active) VALUES($1,$2,$3)");
        assert_eq!(call.args, [Value::BigInt(1), Value::from("ann"), Value::Bool(true)]);
    }

    /// Double-quotes identifiers; placeholders match the default formatter.
    #[derive(Debug)]
    struct QuotingFormatter(StdQueryFormatter);

    impl QueryFormatter for QuotingFormatter {
        fn format_table_name(&self, name: &str) -> Result<String> {
            self.0.format_table_name(name).map(|t| format!("\"{t}\""))
        }

        fn format_column_name(&self, name: &str) -> Result<String> {
            self.0.format_column_name(name).map(|c| format!("\"{c}\""))
        }

        fn format_placeholder(&self, index: usize) -> String {
            self.0.format_placeholder(index)
        }

        fn placeholder_style(&self) -> &str {
            self.0.placeholder_style()
        }
    }

    #[test]
    fn test_statements_are_cached_per_dialect() {
        #[derive(Debug, Default, Clone, Record)]
        #[db(table = "dml_items")]
        struct Item {
            #[db("id", pk)]
            id: i64,
            #[db("name")]
            name: String,
        }

        let plain_driver = MockDriver::new();
        let quoted_driver = MockDriver::new();
        let config = Config::parse("mock://localhost/session_tests").unwrap();
        let plain = Ctx::new().with_conn(Arc::new(DbConn::new(Arc::new(plain_driver.clone()), config.clone())));
        let quoted = Ctx::new().with_conn(Arc::new(
            DbConn::new(Arc::new(quoted_driver.clone()), config)
                .with_formatter(Arc::new(QuotingFormatter(StdQueryFormatter::new()))),
        ));
        let item = Item {
            id: 1,
            name: "bolt".to_string(),
        };

        block_on(|cx| async move {
            for _ in 0..2 {
                unwrap_outcome(insert_record(&cx, &plain, &item, &[]).await);
                unwrap_outcome(insert_record(&cx, &quoted, &item, &[]).await);
            }
        });
        let plain_sql = "INSERT INTO dml_items(id,name) VALUES($1,$2)";
        let quoted_sql = r#"INSERT INTO "dml_items"("id","name") VALUES($1,$2)"#;
        assert_eq!(plain_driver.queries(), [plain_sql, plain_sql]);
        assert_eq!(quoted_driver.queries(), [quoted_sql, quoted_sql]);
    }

    #[test]
    fn test_update_and_upsert_statements() {
        let (driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            unwrap_outcome(update_record(&cx, &ctx, &ann(), &[]).await);
            unwrap_outcome(upsert_record(&cx, &ctx, &ann(), &[]).await);
        });
        assert_eq!(
            driver.queries(),
            [
                "UPDATE dml_users SET name=$2, active=$3 WHERE id = $1",
                "INSERT INTO dml_users(id,name,active) VALUES($1,$2,$3) ON CONFLICT(id) DO UPDATE SET name=$2, active=$3",
            ]
        );
    }

    #[test]
    fn test_records_without_primary_key_cannot_be_updated() {
        let (driver, ctx) = mock_ctx();
        let line = LogLine {
            message: "hi".to_string(),
        };
        block_on(|cx| async move {
            for outcome in [
                update_record(&cx, &ctx, &line, &[]).await,
                upsert_record(&cx, &ctx, &line, &[]).await,
            ] {
                match outcome {
                    Outcome::Err(e) => assert_eq!(e.mapping_kind(), Some(MappingErrorKind::NoPrimaryKey)),
                    _ => panic!("expected missing primary key"),
                }
            }
        });
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_pk_only_upsert_does_nothing_on_conflict() {
        let (driver, ctx) = mock_ctx();
        let tag = Tag {
            tag: "rust".to_string(),
        };
        block_on(|cx| async move {
            unwrap_outcome(upsert_record(&cx, &ctx, &tag, &[]).await);
        });
        assert_eq!(
            driver.queries(),
            ["INSERT INTO dml_tags(tag) VALUES($1) ON CONFLICT(tag) DO NOTHING"]
        );
    }

    #[test]
    fn test_insert_unique_reports_whether_inserted() {
        let (driver, ctx) = mock_ctx();
        let query = "INSERT INTO dml_users(id,name,active) VALUES($1,$2,$3) ON CONFLICT (id) DO NOTHING RETURNING TRUE";
        driver.add_rows(query, ["bool"], vec![vec![Value::Bool(true)]]);
        driver.add_rows(query, ["bool"], vec![]);

        block_on(|cx| async move {
            assert!(unwrap_outcome(insert_unique_record(&cx, &ctx, &ann(), "(id)", &[]).await));
            assert!(!unwrap_outcome(insert_unique_record(&cx, &ctx, &ann(), "id", &[]).await));
        });
        assert_eq!(driver.open_rows(), 0);
    }

    #[test]
    fn test_read_by_pk() {
        let (driver, ctx) = mock_ctx();
        let query = "SELECT * FROM dml_users WHERE id = $1";
        driver.add_rows(
            query,
            ["id", "name", "active", "created_at"],
            vec![vec![
                Value::BigInt(1),
                Value::from("ann"),
                Value::Bool(true),
                Value::from("2024-01-01"),
            ]],
        );

        block_on(|cx| async move {
            let user: User = unwrap_outcome(read_record_by_pk(&cx, &ctx, &[Value::BigInt(1)]).await);
            assert_eq!(user.created_at.as_deref(), Some("2024-01-01"));

            let fallback = unwrap_outcome(read_record_by_pk_or(&cx, &ctx, User::default(), &[Value::BigInt(2)]).await);
            assert_eq!(fallback, User::default());

            match read_record_by_pk::<User>(&cx, &ctx, &[Value::BigInt(1), Value::BigInt(2)]).await {
                Outcome::Err(e) => assert_eq!(e.mapping_kind(), Some(MappingErrorKind::ColumnCount)),
                _ => panic!("expected primary key count error"),
            }
        });
    }

    #[test]
    fn test_values_map_statements() {
        let (driver, ctx) = mock_ctx();
        driver.on_exec(|_, _| Ok(3));
        let values = Values::new().with("name", "bob").with("active", false);

        let affected = block_on(|cx| async move {
            unwrap_outcome(insert(&cx, &ctx, "dml_users", &values).await);
            match insert(&cx, &ctx, "dml_users", &Values::new()).await {
                Outcome::Err(e) => assert_eq!(e.mapping_kind(), Some(MappingErrorKind::NoValues)),
                _ => panic!("expected no values"),
            }
            unwrap_outcome(update(&cx, &ctx, "dml_users", &values, "id = $1", &[Value::BigInt(4)]).await)
        });
        assert_eq!(affected, 3);
        let calls = driver.calls();
        assert_eq!(calls[0].query, "INSERT INTO dml_users(active,name) VALUES($1,$2)");
        assert_eq!(calls[1].query, "UPDATE dml_users SET active=$2, name=$3 WHERE id = $1");
        assert_eq!(
            calls[1].args,
            [Value::BigInt(4), Value::Bool(false), Value::from("bob")]
        );
    }

    #[test]
    fn test_batch_insert_uses_one_prepared_statement_in_a_transaction() {
        let (driver, ctx) = mock_ctx();
        let users: Vec<User> = (1..=3)
            .map(|id| User {
                id,
                ..ann()
            })
            .collect();

        block_on(|cx| async move {
            unwrap_outcome(insert_records(&cx, &ctx, &users, &[]).await);
        });

        let kinds: Vec<CallKind> = driver.calls().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            [
                CallKind::Begin,
                CallKind::Prepare,
                CallKind::StmtExec,
                CallKind::StmtExec,
                CallKind::StmtExec,
                CallKind::Commit,
            ]
        );
        assert_eq!(driver.open_statements(), 0);
        assert!(driver.calls().iter().all(|c| c.tx.is_some()));
    }

    #[test]
    fn test_batch_of_one_skips_the_transaction() {
        let (driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            unwrap_outcome(upsert_records(&cx, &ctx, &[ann()], &[]).await);
            unwrap_outcome(update_records::<User>(&cx, &ctx, &[], &[]).await);
        });
        let kinds: Vec<CallKind> = driver.calls().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, [CallKind::Exec]);
    }

    #[test]
    fn test_failed_batch_rolls_back_and_closes_statement() {
        let (driver, ctx) = mock_ctx();
        driver.on_exec(|_, args| {
            if args.first() == Some(&Value::BigInt(2)) {
                Err(Error::from_sqlstate("23505", "duplicate key"))
            } else {
                Ok(1)
            }
        });
        let users = vec![ann(), User { id: 2, ..ann() }, User { id: 3, ..ann() }];

        block_on(|cx| async move {
            assert!(matches!(update_records(&cx, &ctx, &users, &[]).await, Outcome::Err(_)));
        });
        let kinds: Vec<CallKind> = driver.calls().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            [
                CallKind::Begin,
                CallKind::Prepare,
                CallKind::StmtExec,
                CallKind::StmtExec,
                CallKind::Rollback,
            ]
        );
        assert_eq!(driver.open_statements(), 0);
    }

    #[test]
    fn test_prepared_statements_reject_value_dependent_filters() {
        let (_driver, ctx) = mock_ctx();
        block_on(|cx| async move {
            assert!(matches!(
                prepare_insert_record::<User>(&cx, &ctx, &[ColumnFilter::IgnoreNull]).await,
                Outcome::Err(_)
            ));
        });
    }

    #[test]
    fn test_prepared_read_and_insert_unique() {
        let (driver, ctx) = mock_ctx();
        driver.on_query(|query, args| {
            let rows = if query.starts_with("SELECT") && args == [Value::BigInt(1)] {
                vec![vec![Value::BigInt(1), Value::from("ann"), Value::Bool(true), Value::Null]]
            } else {
                Vec::new()
            };
            Ok(sqldb_mock::mock_rows(["id", "name", "active", "created_at"], rows))
        });

        block_on(|cx| async move {
            let read = unwrap_outcome(prepare_read_record_by_pk::<User>(&cx, &ctx).await);
            assert_eq!(read.query(), "SELECT * FROM dml_users WHERE id = $1");
            let user = unwrap_outcome(read.read(&cx, &[Value::BigInt(1)]).await);
            assert_eq!(user.name, "ann");
            match read.read(&cx, &[Value::BigInt(9)]).await {
                Outcome::Err(e) => assert!(e.is_no_rows()),
                _ => panic!("expected NoRows"),
            }
            unwrap_outcome(read.close(&cx).await);

            let unique = unwrap_outcome(prepare_insert_unique_record::<User>(&cx, &ctx, "id", &[]).await);
            assert!(!unwrap_outcome(unique.insert(&cx, &ann()).await));
            unwrap_outcome(unique.close(&cx).await);
        });
        assert_eq!(driver.open_statements(), 0);
        assert_eq!(driver.open_rows(), 0);
    }
}
