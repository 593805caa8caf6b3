//! Connections: a driver handle plus the dialect pieces needed to build and
//! annotate statements.

use asupersync::{Cx, Outcome};
use async_trait::async_trait;
use sqldb_core::{
    Config, ConnectionErrorKind, Driver, DriverStats, Error, Result, Rows, Stmt, TxOptions, Value,
};
use sqldb_notify::{ListenerHolder, ListenerRegistry, OnNotify, OnUnlisten};
use sqldb_query::{QueryBuilder, QueryFormatter, StdQueryBuilder, StdQueryFormatter, wrap_error_with_query};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Identity of an open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxInfo {
    /// Process-wide serial number assigned when the transaction began
    pub serial: u64,
    /// Options the transaction was opened with, `None` for defaults
    pub opts: Option<TxOptions>,
}

/// A database connection as seen by the rest of sqldb.
///
/// A transaction is a connection too: [`Connection::begin`] returns a
/// connection bound to the new transaction, which reports its
/// [`TxInfo`] and the connection it was started from.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn config(&self) -> &Config;

    fn stats(&self) -> DriverStats;

    fn formatter(&self) -> &dyn QueryFormatter;

    fn query_builder(&self) -> &dyn QueryBuilder;

    async fn ping(&self, cx: &Cx, timeout: Duration) -> Outcome<(), Error>;

    async fn exec(&self, cx: &Cx, query: &str, args: &[Value]) -> Outcome<u64, Error>;

    async fn query(&self, cx: &Cx, query: &str, args: &[Value]) -> Outcome<Box<dyn Rows>, Error>;

    async fn prepare(&self, cx: &Cx, query: &str) -> Outcome<Box<dyn Stmt>, Error>;

    /// `Some` for transaction connections.
    fn transaction_info(&self) -> Option<TxInfo>;

    fn is_transaction(&self) -> bool {
        self.transaction_info().is_some()
    }

    /// The connection a transaction was started from.
    fn parent_connection(&self) -> Option<Arc<dyn Connection>>;

    /// Begin a transaction and return the connection bound to it.
    async fn begin(
        &self,
        cx: &Cx,
        serial: u64,
        opts: Option<TxOptions>,
    ) -> Outcome<Arc<dyn Connection>, Error>;

    async fn commit(&self, cx: &Cx) -> Outcome<(), Error>;

    async fn rollback(&self, cx: &Cx) -> Outcome<(), Error>;

    /// Subscribe to a notification channel.
    fn listen_on_channel(
        &self,
        channel: &str,
        on_notify: Option<OnNotify>,
        on_unlisten: Option<OnUnlisten>,
    ) -> Result<()>;

    fn unlisten_channel(&self, channel: &str) -> Result<()>;

    fn is_listening_on_channel(&self, channel: &str) -> bool;

    async fn close(&self, cx: &Cx) -> Outcome<(), Error>;
}

fn wrap<T>(
    outcome: Outcome<T, Error>,
    query: &str,
    args: &[Value],
    formatter: &dyn QueryFormatter,
) -> Outcome<T, Error> {
    match outcome {
        Outcome::Err(e) => Outcome::Err(wrap_error_with_query(e, query, args, formatter)),
        other => other,
    }
}

// ============================================================================
// DbConn
// ============================================================================

#[derive(Clone)]
struct TxState {
    info: TxInfo,
    parent: Arc<dyn Connection>,
}

/// The standard [`Connection`] over a [`Driver`].
///
/// Every statement error is annotated with the query and its formatted
/// arguments. Cloning is cheap and clones share the driver handle.
///
/// Connections with the same URL share one listener. Closing a connection
/// gives up its subscriptions' claim on it; the listener stops when the last
/// connection that listened is closed.
#[derive(Clone)]
pub struct DbConn {
    driver: Arc<dyn Driver>,
    config: Arc<Config>,
    formatter: Arc<dyn QueryFormatter>,
    builder: Arc<dyn QueryBuilder>,
    listeners: Arc<ListenerRegistry>,
    holder: ListenerHolder,
    tx: Option<TxState>,
}

impl fmt::Debug for DbConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConn")
            .field("driver", &self.driver)
            .field("host", &self.config.host)
            .field("database", &self.config.database)
            .field("tx", &self.tx.as_ref().map(|t| t.info))
            .finish_non_exhaustive()
    }
}

impl DbConn {
    /// Wrap `driver` with the PostgreSQL formatter and builder and the
    /// process-wide listener registry.
    pub fn new(driver: Arc<dyn Driver>, config: Config) -> Self {
        let formatter: Arc<dyn QueryFormatter> = Arc::new(StdQueryFormatter::new());
        Self {
            driver,
            config: Arc::new(config),
            builder: Arc::new(StdQueryBuilder::new(Arc::clone(&formatter))),
            formatter,
            listeners: ListenerRegistry::global(),
            holder: ListenerHolder::new(),
            tx: None,
        }
    }

    /// Like [`DbConn::new`] with the config parsed from `url`.
    pub fn from_url(driver: Arc<dyn Driver>, url: &str) -> Result<Self> {
        Ok(Self::new(driver, Config::parse(url)?))
    }

    /// Use another formatter; the builder is rebuilt on top of it.
    #[must_use]
    pub fn with_formatter(mut self, formatter: Arc<dyn QueryFormatter>) -> Self {
        self.builder = Arc::new(StdQueryBuilder::new(Arc::clone(&formatter)));
        self.formatter = formatter;
        self
    }

    #[must_use]
    pub fn with_query_builder(mut self, builder: Arc<dyn QueryBuilder>) -> Self {
        self.builder = builder;
        self
    }

    #[must_use]
    pub fn with_listener_registry(mut self, listeners: Arc<ListenerRegistry>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

#[async_trait]
impl Connection for DbConn {
    fn config(&self) -> &Config {
        &self.config
    }

    fn stats(&self) -> DriverStats {
        self.driver.stats()
    }

    fn formatter(&self) -> &dyn QueryFormatter {
        self.formatter.as_ref()
    }

    fn query_builder(&self) -> &dyn QueryBuilder {
        self.builder.as_ref()
    }

    async fn ping(&self, cx: &Cx, timeout: Duration) -> Outcome<(), Error> {
        self.driver.ping(cx, timeout).await
    }

    async fn exec(&self, cx: &Cx, query: &str, args: &[Value]) -> Outcome<u64, Error> {
        tracing::trace!(query, args = args.len(), "Executing statement");
        wrap(self.driver.exec(cx, query, args).await, query, args, self.formatter())
    }

    async fn query(&self, cx: &Cx, query: &str, args: &[Value]) -> Outcome<Box<dyn Rows>, Error> {
        tracing::trace!(query, args = args.len(), "Running query");
        wrap(self.driver.query(cx, query, args).await, query, args, self.formatter())
    }

    async fn prepare(&self, cx: &Cx, query: &str) -> Outcome<Box<dyn Stmt>, Error> {
        match self.driver.prepare(cx, query).await {
            Outcome::Ok(inner) => {
                let stmt: Box<dyn Stmt> = Box::new(DbStmt {
                    inner,
                    formatter: Arc::clone(&self.formatter),
                });
                Outcome::Ok(stmt)
            }
            other => wrap(other, query, &[], self.formatter()),
        }
    }

    fn transaction_info(&self) -> Option<TxInfo> {
        self.tx.as_ref().map(|t| t.info)
    }

    fn parent_connection(&self) -> Option<Arc<dyn Connection>> {
        self.tx.as_ref().map(|t| Arc::clone(&t.parent))
    }

    async fn begin(
        &self,
        cx: &Cx,
        serial: u64,
        opts: Option<TxOptions>,
    ) -> Outcome<Arc<dyn Connection>, Error> {
        if self.tx.is_some() {
            return Outcome::Err(Error::within_transaction());
        }
        let driver = match self.driver.begin(cx, opts).await {
            Outcome::Ok(driver) => driver,
            Outcome::Err(e) => {
                return Outcome::Err(wrap_error_with_query(e, "BEGIN", &[], self.formatter()));
            }
            Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
            Outcome::Panicked(payload) => return Outcome::Panicked(payload),
        };
        tracing::debug!(serial, ?opts, "Began transaction");
        let tx: Arc<dyn Connection> = Arc::new(DbConn {
            driver,
            config: Arc::clone(&self.config),
            formatter: Arc::clone(&self.formatter),
            builder: Arc::clone(&self.builder),
            listeners: Arc::clone(&self.listeners),
            holder: self.holder,
            tx: Some(TxState {
                info: TxInfo { serial, opts },
                parent: Arc::new(self.clone()),
            }),
        });
        Outcome::Ok(tx)
    }

    async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        let Some(tx) = &self.tx else {
            return Outcome::Err(Error::not_within_transaction());
        };
        tracing::debug!(serial = tx.info.serial, "Committing transaction");
        wrap(self.driver.commit(cx).await, "COMMIT", &[], self.formatter())
    }

    async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        let Some(tx) = &self.tx else {
            return Outcome::Err(Error::not_within_transaction());
        };
        tracing::debug!(serial = tx.info.serial, "Rolling back transaction");
        wrap(self.driver.rollback(cx).await, "ROLLBACK", &[], self.formatter())
    }

    fn listen_on_channel(
        &self,
        channel: &str,
        on_notify: Option<OnNotify>,
        on_unlisten: Option<OnUnlisten>,
    ) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::within_transaction());
        }
        let connector = self.driver.listener_connector().ok_or_else(|| {
            Error::connection(
                ConnectionErrorKind::Unsupported,
                "driver does not support LISTEN",
            )
        })?;
        self.listeners
            .listen_as(self.holder, &self.config.url(), &connector, channel, on_notify, on_unlisten)
    }

    fn unlisten_channel(&self, channel: &str) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::within_transaction());
        }
        self.listeners.unlisten(&self.config.url(), channel)
    }

    fn is_listening_on_channel(&self, channel: &str) -> bool {
        self.tx.is_none() && self.listeners.is_listening(&self.config.url(), channel)
    }

    async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        if self.tx.is_none() {
            self.listeners.release(&self.config.url(), self.holder);
        }
        self.driver.close(cx).await
    }
}

/// A prepared statement whose errors carry the statement text.
#[derive(Debug)]
struct DbStmt {
    inner: Box<dyn Stmt>,
    formatter: Arc<dyn QueryFormatter>,
}

#[async_trait]
impl Stmt for DbStmt {
    fn query_text(&self) -> &str {
        self.inner.query_text()
    }

    async fn exec(&self, cx: &Cx, args: &[Value]) -> Outcome<u64, Error> {
        wrap(
            self.inner.exec(cx, args).await,
            self.inner.query_text(),
            args,
            self.formatter.as_ref(),
        )
    }

    async fn query(&self, cx: &Cx, args: &[Value]) -> Outcome<Box<dyn Rows>, Error> {
        wrap(
            self.inner.query(cx, args).await,
            self.inner.query_text(),
            args,
            self.formatter.as_ref(),
        )
    }

    async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        self.inner.close(cx).await
    }
}

// ============================================================================
// ErrConn
// ============================================================================

/// A connection on which every operation fails with the same error.
///
/// Used as the process-wide default before a real connection is
/// installed.
#[derive(Debug, Clone)]
pub struct ErrConn {
    err: Error,
    config: Config,
    formatter: StdQueryFormatter,
    builder: StdQueryBuilder,
}

impl ErrConn {
    pub fn new(err: Error) -> Self {
        Self {
            err,
            config: Config::default(),
            formatter: StdQueryFormatter::new(),
            builder: StdQueryBuilder::default(),
        }
    }

    pub fn error(&self) -> &Error {
        &self.err
    }

    fn fail<T>(&self) -> Outcome<T, Error> {
        Outcome::Err(self.err.clone())
    }
}

#[async_trait]
impl Connection for ErrConn {
    fn config(&self) -> &Config {
        &self.config
    }

    fn stats(&self) -> DriverStats {
        DriverStats::default()
    }

    fn formatter(&self) -> &dyn QueryFormatter {
        &self.formatter
    }

    fn query_builder(&self) -> &dyn QueryBuilder {
        &self.builder
    }

    async fn ping(&self, _cx: &Cx, _timeout: Duration) -> Outcome<(), Error> {
        self.fail()
    }

    async fn exec(&self, _cx: &Cx, _query: &str, _args: &[Value]) -> Outcome<u64, Error> {
        self.fail()
    }

    async fn query(&self, _cx: &Cx, _query: &str, _args: &[Value]) -> Outcome<Box<dyn Rows>, Error> {
        self.fail()
    }

    async fn prepare(&self, _cx: &Cx, _query: &str) -> Outcome<Box<dyn Stmt>, Error> {
        self.fail()
    }

    fn transaction_info(&self) -> Option<TxInfo> {
        None
    }

    fn parent_connection(&self) -> Option<Arc<dyn Connection>> {
        None
    }

    async fn begin(
        &self,
        _cx: &Cx,
        _serial: u64,
        _opts: Option<TxOptions>,
    ) -> Outcome<Arc<dyn Connection>, Error> {
        self.fail()
    }

    async fn commit(&self, _cx: &Cx) -> Outcome<(), Error> {
        self.fail()
    }

    async fn rollback(&self, _cx: &Cx) -> Outcome<(), Error> {
        self.fail()
    }

    fn listen_on_channel(
        &self,
        _channel: &str,
        _on_notify: Option<OnNotify>,
        _on_unlisten: Option<OnUnlisten>,
    ) -> Result<()> {
        Err(self.err.clone())
    }

    fn unlisten_channel(&self, _channel: &str) -> Result<()> {
        Err(self.err.clone())
    }

    fn is_listening_on_channel(&self, _channel: &str) -> bool {
        false
    }

    async fn close(&self, _cx: &Cx) -> Outcome<(), Error> {
        self.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{block_on, unwrap_outcome};
    use sqldb_core::QueryErrorKind;
    use sqldb_mock::MockDriver;

    fn conn(driver: &MockDriver) -> DbConn {
        DbConn::new(Arc::new(driver.clone()), Config::parse("mock://localhost/conn_tests").unwrap())
    }

    #[test]
    fn test_errors_carry_formatted_query() {
        let driver = MockDriver::new();
        driver.on_exec(|_, _| Err(Error::query(QueryErrorKind::Constraint, "duplicate key")));
        let conn = conn(&driver);

        block_on(|cx| async move {
            match conn
                .exec(&cx, "DELETE FROM users WHERE name = $1", &[Value::from("O'Brien")])
                .await
            {
                Outcome::Err(e) => assert_eq!(
                    e.query_text(),
                    Some("DELETE FROM users WHERE name = 'O''Brien'")
                ),
                _ => panic!("expected error"),
            }
        });
    }

    #[test]
    fn test_begin_produces_transaction_connection() {
        let driver = MockDriver::new();
        let conn = conn(&driver);

        block_on(|cx| async move {
            assert!(!conn.is_transaction());
            let tx = unwrap_outcome(conn.begin(&cx, 7, Some(TxOptions::read_only())).await);
            assert_eq!(
                tx.transaction_info(),
                Some(TxInfo {
                    serial: 7,
                    opts: Some(TxOptions::read_only())
                })
            );
            assert!(tx.parent_connection().is_some_and(|p| !p.is_transaction()));

            match tx.begin(&cx, 8, None).await {
                Outcome::Err(e) => assert!(e.is_within_transaction()),
                _ => panic!("nested begin must fail"),
            }
            match conn.commit(&cx).await {
                Outcome::Err(e) => assert!(e.is_not_within_transaction()),
                _ => panic!("commit outside a transaction must fail"),
            }
            unwrap_outcome(tx.commit(&cx).await);
        });
        assert_eq!(driver.queries(), ["BEGIN", "COMMIT"]);
    }

    #[test]
    fn test_prepared_statement_errors_are_wrapped() {
        let driver = MockDriver::new();
        driver.on_exec(|_, _| Err(Error::custom("boom")));
        let conn = conn(&driver);

        block_on(|cx| async move {
            let stmt = unwrap_outcome(conn.prepare(&cx, "UPDATE t SET a = $1").await);
            match stmt.exec(&cx, &[Value::BigInt(3)]).await {
                Outcome::Err(e) => assert_eq!(e.to_string(), "boom from query: UPDATE t SET a = 3"),
                _ => panic!("expected error"),
            }
            unwrap_outcome(stmt.close(&cx).await);
        });
        assert_eq!(driver.open_statements(), 0);
    }

    #[test]
    fn test_listen_requires_support_and_no_transaction() {
        let driver = MockDriver::without_listener();
        let conn = conn(&driver);
        let err = conn.listen_on_channel("jobs", None, None).unwrap_err();
        assert!(err.is_connection_error());

        let driver = MockDriver::new();
        let conn = self::conn(&driver);
        block_on(|cx| async move {
            let tx = unwrap_outcome(conn.begin(&cx, 1, None).await);
            assert!(tx.listen_on_channel("jobs", None, None).unwrap_err().is_within_transaction());
            assert!(tx.unlisten_channel("jobs").unwrap_err().is_within_transaction());
            unwrap_outcome(tx.rollback(&cx).await);
        });
    }

    #[test]
    fn test_err_conn_never_succeeds() {
        let conn = ErrConn::new(Error::connection(ConnectionErrorKind::NotConfigured, "nope"));
        block_on(|cx| async move {
            assert!(matches!(conn.exec(&cx, "SELECT 1", &[]).await, Outcome::Err(_)));
            assert!(matches!(conn.query(&cx, "SELECT 1", &[]).await, Outcome::Err(_)));
            assert!(matches!(conn.begin(&cx, 1, None).await, Outcome::Err(_)));
            assert!(matches!(conn.ping(&cx, Duration::from_secs(1)).await, Outcome::Err(_)));
            assert!(conn.listen_on_channel("c", None, None).is_err());
            assert!(!conn.is_listening_on_channel("c"));
        });
    }
}
