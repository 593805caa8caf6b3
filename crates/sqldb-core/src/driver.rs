//! The driver contract.
//!
//! A driver is the wire-level client sitting below sqldb. The crate never
//! speaks the PostgreSQL protocol itself; everything goes through the
//! object-safe traits in this module so connections can be carried
//! type-erased in a request context.

use crate::error::{Error, Result};
use crate::row::Rows;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Duration;

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Whatever the server is configured for (READ COMMITTED on PostgreSQL)
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Position in the standard SQL strictness order.
    pub const fn strictness(self) -> u8 {
        match self {
            IsolationLevel::ReadUncommitted => 0,
            IsolationLevel::Default | IsolationLevel::ReadCommitted => 1,
            IsolationLevel::RepeatableRead => 2,
            IsolationLevel::Serializable => 3,
        }
    }

    /// SQL keyword form, `None` for [`IsolationLevel::Default`].
    pub const fn as_sql(self) -> Option<&'static str> {
        match self {
            IsolationLevel::Default => None,
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
        }
    }
}

/// Options for beginning a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TxOptions {
    pub const fn new() -> Self {
        Self {
            isolation: IsolationLevel::Default,
            read_only: false,
        }
    }

    pub const fn read_only() -> Self {
        Self {
            isolation: IsolationLevel::Default,
            read_only: true,
        }
    }

    pub const fn serializable() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            read_only: false,
        }
    }

    pub const fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    /// Statement that configures a just-opened transaction, if any.
    pub fn set_transaction_sql(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(level) = self.isolation.as_sql() {
            parts.push(format!("ISOLATION LEVEL {level}"));
        }
        if self.read_only {
            parts.push("READ ONLY".to_string());
        }
        if parts.is_empty() {
            None
        } else {
            Some(format!("SET TRANSACTION {}", parts.join(", ")))
        }
    }
}

/// Connection pool statistics reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStats {
    pub max_open_connections: usize,
    pub open_connections: usize,
    pub in_use: usize,
    pub idle: usize,
    pub wait_count: u64,
    pub wait_duration: Duration,
}

/// A wire driver handle.
///
/// Transaction handles returned by [`Driver::begin`] implement the same
/// trait; `commit` and `rollback` are only meaningful on them.
#[async_trait]
pub trait Driver: Send + Sync + fmt::Debug {
    async fn exec(&self, cx: &Cx, query: &str, args: &[Value]) -> Outcome<u64, Error>;

    async fn query(&self, cx: &Cx, query: &str, args: &[Value]) -> Outcome<Box<dyn Rows>, Error>;

    async fn prepare(&self, cx: &Cx, query: &str) -> Outcome<Box<dyn Stmt>, Error>;

    async fn begin(&self, cx: &Cx, opts: Option<TxOptions>) -> Outcome<Arc<dyn Driver>, Error>;

    async fn commit(&self, cx: &Cx) -> Outcome<(), Error>;

    async fn rollback(&self, cx: &Cx) -> Outcome<(), Error>;

    async fn ping(&self, cx: &Cx, timeout: Duration) -> Outcome<(), Error>;

    fn stats(&self) -> DriverStats;

    async fn close(&self, cx: &Cx) -> Outcome<(), Error>;

    /// Factory for dedicated LISTEN connections, for drivers that support it.
    fn listener_connector(&self) -> Option<Arc<dyn ListenerConnector>> {
        None
    }
}

/// A prepared statement bound to one driver handle.
#[async_trait]
pub trait Stmt: Send + Sync + fmt::Debug {
    /// The query text the statement was prepared from.
    fn query_text(&self) -> &str;

    async fn exec(&self, cx: &Cx, args: &[Value]) -> Outcome<u64, Error>;

    async fn query(&self, cx: &Cx, args: &[Value]) -> Outcome<Box<dyn Rows>, Error>;

    async fn close(&self, cx: &Cx) -> Outcome<(), Error>;
}

// ============================================================================
// LISTEN / NOTIFY
// ============================================================================

/// A notification delivered on a LISTEN channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Backend process that sent the notification
    pub process_id: u32,
    pub channel: String,
    pub payload: String,
}

/// Events a listener connection pushes to its owner.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    Notification(Notification),
    /// The connection was lost; the owner should reconnect.
    Disconnected(Error),
    /// The connection was closed deliberately.
    Closed,
}

/// A dedicated, long-lived connection used only for LISTEN.
///
/// Notifications arrive on the event sender passed to
/// [`ListenerConnector::connect`].
pub trait ListenerConn: Send + Sync {
    fn listen(&self, channel: &str) -> Result<()>;

    fn unlisten(&self, channel: &str) -> Result<()>;

    fn ping(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Opens listener connections for a connection URL.
pub trait ListenerConnector: Send + Sync {
    fn connect(&self, url: &str, events: Sender<ListenerEvent>) -> Result<Arc<dyn ListenerConn>>;
}
