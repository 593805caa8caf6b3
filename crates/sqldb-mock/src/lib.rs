//! In-process mock driver for testing code built on sqldb.
//!
//! [`MockDriver`] implements the full [`Driver`] contract without a server:
//!
//! - every call is recorded as a [`RecordedCall`] for inspection;
//! - result sets are served from canned rows registered per query text
//!   with [`MockDriver::add_rows`], or produced by a query hook;
//! - each method can be overridden with a hook, e.g. to fail the first few
//!   attempts of a statement;
//! - `begin` stamps the returned handle with a fresh transaction id, which
//!   is recorded on every call made through it;
//! - LISTEN connections are served by an in-memory
//!   [`MockListenerConnector`] that can inject notifications and
//!   disconnects.
//!
//! [`NullDriver`] accepts everything and returns empty results.

use asupersync::{Cx, Outcome};
use async_trait::async_trait;
use sqldb_core::{
    ConnectionErrorKind, Driver, DriverStats, Error, ListenerConn, ListenerConnector,
    ListenerEvent, Notification, Result, Rows, Stmt, TxOptions, Value, VecRows,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

/// Lock a mutex, ignoring poisoning: a panicking test body must not break
/// the shared recorder for the assertions that follow.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

macro_rules! bail_if_cancelled {
    ($cx:expr) => {
        if let Some(reason) = $cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
    };
}

fn into_outcome<T>(result: Result<T>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

// ============================================================================
// Rows factories
// ============================================================================

/// A cursor over canned rows.
pub fn mock_rows<S: Into<String>>(
    columns: impl IntoIterator<Item = S>,
    rows: Vec<Vec<Value>>,
) -> Box<dyn Rows> {
    Box::new(VecRows::new(columns, rows))
}

/// A cursor over canned rows that fails with `err` once they are drained.
pub fn mock_rows_with_error<S: Into<String>>(
    columns: impl IntoIterator<Item = S>,
    rows: Vec<Vec<Value>>,
    err: Error,
) -> Box<dyn Rows> {
    Box::new(VecRows::new(columns, rows).with_error(err))
}

/// Counts closes of the wrapped cursor.
struct TrackedRows {
    inner: Box<dyn Rows>,
    closed: bool,
    counter: Arc<AtomicUsize>,
}

#[async_trait]
impl Rows for TrackedRows {
    fn columns(&self) -> &[String] {
        self.inner.columns()
    }

    async fn next(&mut self, cx: &Cx) -> bool {
        self.inner.next(cx).await
    }

    fn values(&self) -> Option<&[Value]> {
        self.inner.values()
    }

    fn err(&self) -> Option<Error> {
        self.inner.err()
    }

    async fn close(&mut self, cx: &Cx) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.close(cx).await
    }
}

// ============================================================================
// Recorded calls and hooks
// ============================================================================

/// The driver method a [`RecordedCall`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Exec,
    Query,
    Prepare,
    /// Execution of a prepared statement
    StmtExec,
    /// Query through a prepared statement
    StmtQuery,
    Begin,
    Commit,
    Rollback,
    Ping,
}

/// One call made against a [`MockDriver`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub kind: CallKind,
    /// Query text; `BEGIN`, `COMMIT`, `ROLLBACK` or `PING` for the
    /// corresponding calls
    pub query: String,
    pub args: Vec<Value>,
    /// Transaction id of the handle the call was made on
    pub tx: Option<u64>,
}

pub type ExecHook = Arc<dyn Fn(&str, &[Value]) -> Result<u64> + Send + Sync>;
pub type QueryHook = Arc<dyn Fn(&str, &[Value]) -> Result<Box<dyn Rows>> + Send + Sync>;
pub type PrepareHook = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;
pub type BeginHook = Arc<dyn Fn(Option<TxOptions>) -> Result<()> + Send + Sync>;
/// Commit and rollback hooks receive the transaction id.
pub type TxHook = Arc<dyn Fn(u64) -> Result<()> + Send + Sync>;
pub type PingHook = Arc<dyn Fn() -> Result<()> + Send + Sync>;

#[derive(Default, Clone)]
struct Hooks {
    exec: Option<ExecHook>,
    query: Option<QueryHook>,
    prepare: Option<PrepareHook>,
    begin: Option<BeginHook>,
    commit: Option<TxHook>,
    rollback: Option<TxHook>,
    ping: Option<PingHook>,
}

struct MockState {
    calls: Mutex<Vec<RecordedCall>>,
    canned: Mutex<HashMap<String, VecDeque<(Vec<String>, Vec<Vec<Value>>)>>>,
    hooks: RwLock<Hooks>,
    next_tx: AtomicU64,
    rows_opened: AtomicUsize,
    rows_closed: Arc<AtomicUsize>,
    stmts_opened: AtomicUsize,
    stmts_closed: AtomicUsize,
    closed: AtomicBool,
    listener: Option<MockListenerConnector>,
}

/// A scriptable in-memory driver.
///
/// Clones share all state, so a test can keep one handle for assertions
/// while the code under test owns another.
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<MockState>,
    tx: Option<u64>,
}

impl fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDriver")
            .field("tx", &self.tx)
            .field("calls", &lock(&self.state.calls).len())
            .finish_non_exhaustive()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// A mock driver with an in-memory listener connector.
    pub fn new() -> Self {
        Self::build(Some(MockListenerConnector::new()))
    }

    /// A mock driver that does not support LISTEN.
    pub fn without_listener() -> Self {
        Self::build(None)
    }

    fn build(listener: Option<MockListenerConnector>) -> Self {
        Self {
            state: Arc::new(MockState {
                calls: Mutex::new(Vec::new()),
                canned: Mutex::new(HashMap::new()),
                hooks: RwLock::new(Hooks::default()),
                next_tx: AtomicU64::new(1),
                rows_opened: AtomicUsize::new(0),
                rows_closed: Arc::new(AtomicUsize::new(0)),
                stmts_opened: AtomicUsize::new(0),
                stmts_closed: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                listener,
            }),
            tx: None,
        }
    }

    /// Transaction id of this handle, `None` for the base driver.
    pub fn tx_id(&self) -> Option<u64> {
        self.tx
    }

    /// The in-memory listener connector, if enabled.
    pub fn listener(&self) -> Option<&MockListenerConnector> {
        self.state.listener.as_ref()
    }

    // ---------------------------------------------------------------------
    // Scripting
    // ---------------------------------------------------------------------

    /// Queue a result set for the next query with exactly this text.
    ///
    /// Result sets for the same query are served in the order they were
    /// added; once drained, the query returns no rows.
    pub fn add_rows<S: Into<String>>(
        &self,
        query: &str,
        columns: impl IntoIterator<Item = S>,
        rows: Vec<Vec<Value>>,
    ) -> &Self {
        lock(&self.state.canned)
            .entry(query.to_string())
            .or_default()
            .push_back((columns.into_iter().map(Into::into).collect(), rows));
        self
    }

    fn with_hooks(&self, f: impl FnOnce(&mut Hooks)) -> &Self {
        let mut hooks = self
            .state
            .hooks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut hooks);
        self
    }

    pub fn on_exec(&self, hook: impl Fn(&str, &[Value]) -> Result<u64> + Send + Sync + 'static) -> &Self {
        self.with_hooks(|h| h.exec = Some(Arc::new(hook)))
    }

    /// Override query results. Canned rows are not consulted while a query
    /// hook is installed.
    pub fn on_query(
        &self,
        hook: impl Fn(&str, &[Value]) -> Result<Box<dyn Rows>> + Send + Sync + 'static,
    ) -> &Self {
        self.with_hooks(|h| h.query = Some(Arc::new(hook)))
    }

    pub fn on_prepare(&self, hook: impl Fn(&str) -> Result<()> + Send + Sync + 'static) -> &Self {
        self.with_hooks(|h| h.prepare = Some(Arc::new(hook)))
    }

    pub fn on_begin(
        &self,
        hook: impl Fn(Option<TxOptions>) -> Result<()> + Send + Sync + 'static,
    ) -> &Self {
        self.with_hooks(|h| h.begin = Some(Arc::new(hook)))
    }

    pub fn on_commit(&self, hook: impl Fn(u64) -> Result<()> + Send + Sync + 'static) -> &Self {
        self.with_hooks(|h| h.commit = Some(Arc::new(hook)))
    }

    pub fn on_rollback(&self, hook: impl Fn(u64) -> Result<()> + Send + Sync + 'static) -> &Self {
        self.with_hooks(|h| h.rollback = Some(Arc::new(hook)))
    }

    pub fn on_ping(&self, hook: impl Fn() -> Result<()> + Send + Sync + 'static) -> &Self {
        self.with_hooks(|h| h.ping = Some(Arc::new(hook)))
    }

    /// Remove all hooks.
    pub fn reset_hooks(&self) -> &Self {
        self.with_hooks(|h| *h = Hooks::default())
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.state.calls).clone()
    }

    /// Query text of every statement sent, including `BEGIN`, `COMMIT` and
    /// `ROLLBACK`, in order. Prepares and pings are left out.
    pub fn queries(&self) -> Vec<String> {
        lock(&self.state.calls)
            .iter()
            .filter(|c| !matches!(c.kind, CallKind::Prepare | CallKind::Ping))
            .map(|c| c.query.clone())
            .collect()
    }

    /// The most recent call of `kind`.
    pub fn last_call(&self, kind: CallKind) -> Option<RecordedCall> {
        lock(&self.state.calls)
            .iter()
            .rev()
            .find(|c| c.kind == kind)
            .cloned()
    }

    pub fn clear_calls(&self) {
        lock(&self.state.calls).clear();
    }

    /// Cursors handed out and not yet closed.
    pub fn open_rows(&self) -> usize {
        self.state.rows_opened.load(Ordering::SeqCst)
            - self.state.rows_closed.load(Ordering::SeqCst)
    }

    /// Prepared statements handed out and not yet closed.
    pub fn open_statements(&self) -> usize {
        self.state.stmts_opened.load(Ordering::SeqCst)
            - self.state.stmts_closed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn hooks(&self) -> Hooks {
        self.state
            .hooks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn record(&self, kind: CallKind, query: &str, args: &[Value]) {
        tracing::trace!(?kind, query, tx = ?self.tx, "mock driver call");
        lock(&self.state.calls).push(RecordedCall {
            kind,
            query: query.to_string(),
            args: args.to_vec(),
            tx: self.tx,
        });
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::connection(ConnectionErrorKind::Closed, "mock driver is closed"))
        } else {
            Ok(())
        }
    }

    fn run_exec(&self, query: &str, args: &[Value]) -> Result<u64> {
        self.check_open()?;
        match self.hooks().exec {
            Some(hook) => hook(query, args),
            None => Ok(0),
        }
    }

    fn run_query(&self, query: &str, args: &[Value]) -> Result<Box<dyn Rows>> {
        self.check_open()?;
        let rows: Box<dyn Rows> = match self.hooks().query {
            Some(hook) => hook(query, args)?,
            None => {
                let canned = lock(&self.state.canned)
                    .get_mut(query)
                    .and_then(VecDeque::pop_front);
                match canned {
                    Some((columns, rows)) => mock_rows(columns, rows),
                    None => Box::new(VecRows::empty()),
                }
            }
        };
        self.state.rows_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackedRows {
            inner: rows,
            closed: false,
            counter: Arc::clone(&self.state.rows_closed),
        }))
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn exec(&self, cx: &Cx, query: &str, args: &[Value]) -> Outcome<u64, Error> {
        bail_if_cancelled!(cx);
        self.record(CallKind::Exec, query, args);
        into_outcome(self.run_exec(query, args))
    }

    async fn query(&self, cx: &Cx, query: &str, args: &[Value]) -> Outcome<Box<dyn Rows>, Error> {
        bail_if_cancelled!(cx);
        self.record(CallKind::Query, query, args);
        into_outcome(self.run_query(query, args))
    }

    async fn prepare(&self, cx: &Cx, query: &str) -> Outcome<Box<dyn Stmt>, Error> {
        bail_if_cancelled!(cx);
        self.record(CallKind::Prepare, query, &[]);
        if let Err(e) = self.check_open() {
            return Outcome::Err(e);
        }
        if let Some(hook) = self.hooks().prepare {
            if let Err(e) = hook(query) {
                return Outcome::Err(e);
            }
        }
        self.state.stmts_opened.fetch_add(1, Ordering::SeqCst);
        Outcome::Ok(Box::new(MockStmt {
            driver: self.clone(),
            query: query.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn begin(&self, cx: &Cx, opts: Option<TxOptions>) -> Outcome<Arc<dyn Driver>, Error> {
        bail_if_cancelled!(cx);
        let id = self.state.next_tx.fetch_add(1, Ordering::SeqCst);
        let tx = MockDriver {
            state: Arc::clone(&self.state),
            tx: Some(id),
        };
        tx.record(CallKind::Begin, "BEGIN", &[]);
        if let Err(e) = self.check_open() {
            return Outcome::Err(e);
        }
        if let Some(hook) = self.hooks().begin {
            if let Err(e) = hook(opts) {
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(Arc::new(tx))
    }

    async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        bail_if_cancelled!(cx);
        let Some(id) = self.tx else {
            return Outcome::Err(Error::not_within_transaction());
        };
        self.record(CallKind::Commit, "COMMIT", &[]);
        match self.hooks().commit {
            Some(hook) => into_outcome(hook(id)),
            None => Outcome::Ok(()),
        }
    }

    async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        bail_if_cancelled!(cx);
        let Some(id) = self.tx else {
            return Outcome::Err(Error::not_within_transaction());
        };
        self.record(CallKind::Rollback, "ROLLBACK", &[]);
        match self.hooks().rollback {
            Some(hook) => into_outcome(hook(id)),
            None => Outcome::Ok(()),
        }
    }

    async fn ping(&self, cx: &Cx, _timeout: Duration) -> Outcome<(), Error> {
        bail_if_cancelled!(cx);
        self.record(CallKind::Ping, "PING", &[]);
        if let Err(e) = self.check_open() {
            return Outcome::Err(e);
        }
        match self.hooks().ping {
            Some(hook) => into_outcome(hook()),
            None => Outcome::Ok(()),
        }
    }

    fn stats(&self) -> DriverStats {
        DriverStats {
            open_connections: usize::from(!self.is_closed()),
            in_use: self.open_rows(),
            ..DriverStats::default()
        }
    }

    async fn close(&self, _cx: &Cx) -> Outcome<(), Error> {
        self.state.closed.store(true, Ordering::SeqCst);
        Outcome::Ok(())
    }

    fn listener_connector(&self) -> Option<Arc<dyn ListenerConnector>> {
        self.state
            .listener
            .clone()
            .map(|l| Arc::new(l) as Arc<dyn ListenerConnector>)
    }
}

/// A prepared statement on a [`MockDriver`].
#[derive(Debug)]
pub struct MockStmt {
    driver: MockDriver,
    query: String,
    closed: AtomicBool,
}

impl MockStmt {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::custom(format!("statement {:?} is closed", self.query)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Stmt for MockStmt {
    fn query_text(&self) -> &str {
        &self.query
    }

    async fn exec(&self, cx: &Cx, args: &[Value]) -> Outcome<u64, Error> {
        bail_if_cancelled!(cx);
        self.driver.record(CallKind::StmtExec, &self.query, args);
        into_outcome(self.check_open().and_then(|()| self.driver.run_exec(&self.query, args)))
    }

    async fn query(&self, cx: &Cx, args: &[Value]) -> Outcome<Box<dyn Rows>, Error> {
        bail_if_cancelled!(cx);
        self.driver.record(CallKind::StmtQuery, &self.query, args);
        into_outcome(self.check_open().and_then(|()| self.driver.run_query(&self.query, args)))
    }

    async fn close(&self, _cx: &Cx) -> Outcome<(), Error> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.driver.state.stmts_closed.fetch_add(1, Ordering::SeqCst);
        }
        Outcome::Ok(())
    }
}

// ============================================================================
// Null driver
// ============================================================================

/// A driver that accepts every call and returns empty results.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDriver;

#[derive(Debug)]
struct NullStmt(String);

#[async_trait]
impl Driver for NullDriver {
    async fn exec(&self, _cx: &Cx, _query: &str, _args: &[Value]) -> Outcome<u64, Error> {
        Outcome::Ok(0)
    }

    async fn query(&self, _cx: &Cx, _query: &str, _args: &[Value]) -> Outcome<Box<dyn Rows>, Error> {
        Outcome::Ok(Box::new(VecRows::empty()))
    }

    async fn prepare(&self, _cx: &Cx, query: &str) -> Outcome<Box<dyn Stmt>, Error> {
        Outcome::Ok(Box::new(NullStmt(query.to_string())))
    }

    async fn begin(&self, _cx: &Cx, _opts: Option<TxOptions>) -> Outcome<Arc<dyn Driver>, Error> {
        Outcome::Ok(Arc::new(NullDriver))
    }

    async fn commit(&self, _cx: &Cx) -> Outcome<(), Error> {
        Outcome::Ok(())
    }

    async fn rollback(&self, _cx: &Cx) -> Outcome<(), Error> {
        Outcome::Ok(())
    }

    async fn ping(&self, _cx: &Cx, _timeout: Duration) -> Outcome<(), Error> {
        Outcome::Ok(())
    }

    fn stats(&self) -> DriverStats {
        DriverStats::default()
    }

    async fn close(&self, _cx: &Cx) -> Outcome<(), Error> {
        Outcome::Ok(())
    }
}

#[async_trait]
impl Stmt for NullStmt {
    fn query_text(&self) -> &str {
        &self.0
    }

    async fn exec(&self, _cx: &Cx, _args: &[Value]) -> Outcome<u64, Error> {
        Outcome::Ok(0)
    }

    async fn query(&self, _cx: &Cx, _args: &[Value]) -> Outcome<Box<dyn Rows>, Error> {
        Outcome::Ok(Box::new(VecRows::empty()))
    }

    async fn close(&self, _cx: &Cx) -> Outcome<(), Error> {
        Outcome::Ok(())
    }
}

// ============================================================================
// In-memory LISTEN
// ============================================================================

/// One in-memory LISTEN connection.
pub struct MockListenerConn {
    url: String,
    events: Sender<ListenerEvent>,
    channels: Mutex<Vec<String>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    commands: Arc<Mutex<Vec<String>>>,
}

impl fmt::Debug for MockListenerConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockListenerConn")
            .field("url", &self.url)
            .field("channels", &*lock(&self.channels))
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MockListenerConn {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<String> {
        lock(&self.channels).clone()
    }

    /// How often [`ListenerConn::close`] was called. A connection dropped
    /// with [`MockListenerConnector::disconnect`] still counts zero.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::connection(
                ConnectionErrorKind::Closed,
                "listener connection is closed",
            ))
        } else {
            Ok(())
        }
    }
}

impl ListenerConn for MockListenerConn {
    fn listen(&self, channel: &str) -> Result<()> {
        self.check_open()?;
        lock(&self.commands).push(format!("LISTEN {channel}"));
        let mut channels = lock(&self.channels);
        if !channels.iter().any(|c| c == channel) {
            channels.push(channel.to_string());
        }
        Ok(())
    }

    fn unlisten(&self, channel: &str) -> Result<()> {
        self.check_open()?;
        lock(&self.commands).push(format!("UNLISTEN {channel}"));
        lock(&self.channels).retain(|c| c != channel);
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        self.check_open()?;
        lock(&self.commands).push("PING".to_string());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ListenerEvent::Closed);
        }
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorState {
    connections: Mutex<Vec<Arc<MockListenerConn>>>,
    commands: Arc<Mutex<Vec<String>>>,
    connects: AtomicUsize,
    failures: AtomicUsize,
}

/// Opens in-memory listener connections and lets tests drive them.
#[derive(Clone, Default)]
pub struct MockListenerConnector {
    state: Arc<ConnectorState>,
}

impl fmt::Debug for MockListenerConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockListenerConnector")
            .field("connects", &self.connect_count())
            .finish_non_exhaustive()
    }
}

impl MockListenerConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.failures.store(n, Ordering::SeqCst);
    }

    /// The most recently opened connection.
    pub fn current(&self) -> Option<Arc<MockListenerConn>> {
        lock(&self.state.connections).last().cloned()
    }

    /// Channels the current connection listens on.
    pub fn listening_channels(&self) -> Vec<String> {
        self.current().map(|c| c.channels()).unwrap_or_default()
    }

    /// Every LISTEN, UNLISTEN and PING sent, across connections.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state.commands).clone()
    }

    /// Deliver a notification on the current connection. Returns whether
    /// it was delivered, which requires the connection to listen on
    /// `channel`.
    pub fn notify(&self, channel: &str, payload: &str) -> bool {
        let Some(conn) = self.current() else {
            return false;
        };
        if conn.is_closed() || !conn.channels().iter().any(|c| c == channel) {
            return false;
        }
        conn.events
            .send(ListenerEvent::Notification(Notification {
                process_id: 4242,
                channel: channel.to_string(),
                payload: payload.to_string(),
            }))
            .is_ok()
    }

    /// Drop the current connection as if the server went away.
    pub fn disconnect(&self) -> bool {
        let Some(conn) = self.current() else {
            return false;
        };
        if conn.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        conn.events
            .send(ListenerEvent::Disconnected(Error::connection(
                ConnectionErrorKind::Disconnected,
                "server closed the connection unexpectedly",
            )))
            .is_ok()
    }
}

impl ListenerConnector for MockListenerConnector {
    fn connect(&self, url: &str, events: Sender<ListenerEvent>) -> Result<Arc<dyn ListenerConn>> {
        let failures = self.state.failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.state.failures.store(failures - 1, Ordering::SeqCst);
            return Err(Error::connection(
                ConnectionErrorKind::Refused,
                format!("connection to {url} refused"),
            ));
        }
        let conn = Arc::new(MockListenerConn {
            url: url.to_string(),
            events,
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            commands: Arc::clone(&self.state.commands),
        });
        lock(&self.state.connections).push(Arc::clone(&conn));
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }
}
