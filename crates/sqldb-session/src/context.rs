//! Request-scoped carriage of the active connection.
//!
//! Every operation looks up its connection through a [`Ctx`]. A context
//! without a connection falls back to the process-wide default, which is
//! an [`ErrConn`] until [`set_global_conn`] installs a real one.

use crate::conn::{Connection, ErrConn};
use sqldb_core::{ConnectionErrorKind, Error};
use std::fmt;
use std::sync::{Arc, LazyLock, RwLock};

static GLOBAL_CONN: LazyLock<RwLock<Arc<dyn Connection>>> = LazyLock::new(|| {
    RwLock::new(Arc::new(ErrConn::new(Error::connection(
        ConnectionErrorKind::NotConfigured,
        "no database connection configured",
    ))))
});

/// Install the process-wide default connection.
pub fn set_global_conn(conn: Arc<dyn Connection>) {
    tracing::info!(host = %conn.config().host, database = %conn.config().database, "Installing global connection");
    *GLOBAL_CONN
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = conn;
}

/// The process-wide default connection.
pub fn global_conn() -> Arc<dyn Connection> {
    Arc::clone(
        &GLOBAL_CONN
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner),
    )
}

/// Carries the connection and transaction markers through a call chain.
///
/// Contexts are cheap to clone and immutable: the `with_*` methods return
/// derived contexts.
#[derive(Clone, Default)]
pub struct Ctx {
    conn: Option<Arc<dyn Connection>>,
    serialized: bool,
    without_transactions: bool,
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("conn", &self.conn)
            .field("serialized", &self.serialized)
            .field("without_transactions", &self.without_transactions)
            .finish()
    }
}

impl Ctx {
    /// A context using the global connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context carrying `conn`.
    pub fn with_conn(&self, conn: Arc<dyn Connection>) -> Self {
        Self {
            conn: Some(conn),
            ..self.clone()
        }
    }

    /// The connection carried by this context, or the global default.
    pub fn conn(&self) -> Arc<dyn Connection> {
        match &self.conn {
            Some(conn) => Arc::clone(conn),
            None => global_conn(),
        }
    }

    /// Whether a connection was installed on this context.
    pub fn has_conn(&self) -> bool {
        self.conn.is_some()
    }

    /// Mark that transaction helpers should run their bodies directly,
    /// without opening transactions or savepoints.
    #[must_use]
    pub fn without_transactions(&self) -> Self {
        Self {
            without_transactions: true,
            ..self.clone()
        }
    }

    pub fn is_without_transactions(&self) -> bool {
        self.without_transactions
    }

    /// Whether the context is inside a serialized transaction.
    pub fn is_serialized(&self) -> bool {
        self.serialized
    }

    pub(crate) fn with_serialized(&self, serialized: bool) -> Self {
        Self {
            serialized,
            ..self.clone()
        }
    }
}

/// The connection for `ctx`.
pub fn conn(ctx: &Ctx) -> Arc<dyn Connection> {
    ctx.conn()
}

/// A context derived from `ctx` that carries `conn`.
pub fn context_with_conn(ctx: &Ctx, conn: Arc<dyn Connection>) -> Ctx {
    ctx.with_conn(conn)
}
