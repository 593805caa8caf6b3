//! Error types for sqldb operations.
//!
//! Every public operation returns [`Error`]. Driver failures are classified
//! by SQLSTATE into [`QueryErrorKind`] / [`ConnectionErrorKind`] so callers
//! rarely have to match on message text.

use std::fmt;
use std::sync::Arc;

/// Message PostgreSQL reports for SQLSTATE 40001.
const SERIALIZATION_FAILURE_TEXT: &str = "could not serialize access";

/// Shared, clonable source error.
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync>;

/// The primary error type for all sqldb operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// Connection-related errors (connect, authentication, disconnect)
    Connection(ConnectionError),
    /// Query execution errors reported by the driver
    Query(QueryError),
    /// Record mapping errors (table name, primary key, column resolution)
    Mapping(MappingError),
    /// A driver value could not be decoded into the requested type
    Scan(ScanError),
    /// Transaction state errors
    Transaction(TransactionError),
    /// An identifier did not pass dialect validation
    InvalidIdentifier(String),
    /// A single-row read produced no rows
    NoRows,
    /// Configuration errors (URL parsing, missing settings)
    Config(String),
    /// A non-query error annotated with the statement that caused it
    WithQuery {
        /// The query with arguments substituted for logging.
        query: String,
        /// The original error.
        source: Box<Error>,
    },
    /// Custom error with message
    Custom(String),
}

// ============================================================================
// Connection errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<ErrorSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused
    Refused,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// The connection or driver was already closed
    Closed,
    /// No connection has been configured for this context
    NotConfigured,
    /// The driver does not support the requested capability
    Unsupported,
}

// ============================================================================
// Query errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    /// SQLSTATE reported by the server, if any
    pub sqlstate: Option<String>,
    /// The failing statement, formatted with its arguments
    pub sql: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<usize>,
    pub source: Option<ErrorSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL (class 42)
    Syntax,
    /// Constraint violation (class 23)
    Constraint,
    /// Serialization failure (40001)
    Serialization,
    /// Deadlock or other transaction rollback (class 40)
    Deadlock,
    /// Statement cancelled by the server (57014)
    Cancelled,
    /// Operator intervention / timeout (class 57)
    Timeout,
    /// Any other database error
    Database,
}

// ============================================================================
// Mapping errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    /// Rust type name of the record involved
    pub record: String,
    /// Column involved, if any
    pub column: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// The record type declares no table name
    NoTableName,
    /// The record type has no primary-key column
    NoPrimaryKey,
    /// A result column has no matching record field
    UnmappedColumn,
    /// A result column would be assigned to the same field twice
    DuplicateColumn,
    /// The number of destinations does not match the number of columns
    ColumnCount,
    /// An insert or update was requested without any values
    NoValues,
    /// An update has no non-primary-key column to set
    NoColumns,
}

// ============================================================================
// Scan errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct ScanError {
    /// Destination type name
    pub expected: &'static str,
    /// Source value kind
    pub found: &'static str,
    /// Column being scanned, when known
    pub column: Option<String>,
    pub message: Option<String>,
}

// ============================================================================
// Transaction errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The operation requires a connection outside of a transaction
    WithinTransaction,
    /// The operation requires a transaction connection
    NotWithinTransaction,
    /// Nested transaction options conflict with the enclosing transaction
    IncompatibleOptions,
    /// A serialized transaction was requested inside a plain transaction
    NotSerialized,
    /// The serializable retry loop gave up
    RetriesExhausted,
    /// Rolling back to a savepoint failed after the body failed
    SavepointRollback,
}

// ============================================================================
// Constructors and classification
// ============================================================================

impl Error {
    /// Create a custom error.
    pub fn custom(message: impl Into<String>) -> Self {
        Error::Custom(message.into())
    }

    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            message: message.into(),
            sqlstate: None,
            sql: None,
            detail: None,
            hint: None,
            position: None,
            source: None,
        })
    }

    /// Build an error from a server SQLSTATE code and message.
    ///
    /// Classes 08 and 28 become connection errors; everything else is a
    /// [`QueryError`] whose kind is derived from the code.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match code.get(..2) {
            Some("08") => return Error::connection(ConnectionErrorKind::Connect, message),
            Some("28") => return Error::connection(ConnectionErrorKind::Authentication, message),
            Some("42") => QueryErrorKind::Syntax,
            Some("23") => QueryErrorKind::Constraint,
            Some("40") => {
                if code == "40001" {
                    QueryErrorKind::Serialization
                } else {
                    QueryErrorKind::Deadlock
                }
            }
            Some("57") => {
                if code == "57014" {
                    QueryErrorKind::Cancelled
                } else {
                    QueryErrorKind::Timeout
                }
            }
            _ => QueryErrorKind::Database,
        };
        Error::Query(QueryError {
            kind,
            message,
            sqlstate: Some(code.to_string()),
            sql: None,
            detail: None,
            hint: None,
            position: None,
            source: None,
        })
    }

    pub fn mapping(
        kind: MappingErrorKind,
        record: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Mapping(MappingError {
            kind,
            record: record.into(),
            column: None,
            message: message.into(),
        })
    }

    pub fn unmapped_column(record: &str, column: &str) -> Self {
        Error::Mapping(MappingError {
            kind: MappingErrorKind::UnmappedColumn,
            record: record.to_string(),
            column: Some(column.to_string()),
            message: format!("column {column:?} is not mapped by {record}"),
        })
    }

    pub fn duplicate_column(record: &str, column: &str) -> Self {
        Error::Mapping(MappingError {
            kind: MappingErrorKind::DuplicateColumn,
            record: record.to_string(),
            column: Some(column.to_string()),
            message: format!("duplicate mapped column {column:?} for {record}"),
        })
    }

    pub fn no_primary_key(record: &str) -> Self {
        Error::mapping(
            MappingErrorKind::NoPrimaryKey,
            record,
            format!("{record} has no mapped primary key"),
        )
    }

    pub fn no_values() -> Self {
        Error::mapping(MappingErrorKind::NoValues, "", "no values")
    }

    pub fn column_count(expected: usize, found: usize) -> Self {
        Error::mapping(
            MappingErrorKind::ColumnCount,
            "",
            format!("expected {expected} arguments but query result has {found} columns"),
        )
    }

    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn within_transaction() -> Self {
        Error::transaction(TransactionErrorKind::WithinTransaction, "within transaction")
    }

    pub fn not_within_transaction() -> Self {
        Error::transaction(
            TransactionErrorKind::NotWithinTransaction,
            "not within transaction",
        )
    }

    /// Scan failure for a value that cannot be decoded into `expected`.
    pub fn scan(expected: &'static str, found: &crate::Value) -> Self {
        Error::Scan(ScanError {
            expected,
            found: found.type_name(),
            column: None,
            message: None,
        })
    }

    /// Attach a column name to a scan error; other errors are returned unchanged.
    #[must_use]
    pub fn in_column(self, column: &str) -> Self {
        match self {
            Error::Scan(mut e) if e.column.is_none() => {
                e.column = Some(column.to_string());
                Error::Scan(e)
            }
            other => other,
        }
    }

    /// The error with any query annotation removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithQuery { source, .. } => source.root(),
            other => other,
        }
    }

    /// The formatted query attached to this error, if any.
    pub fn query_text(&self) -> Option<&str> {
        match self {
            Error::WithQuery { query, .. } => Some(query),
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self.root() {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    pub fn is_no_rows(&self) -> bool {
        matches!(self.root(), Error::NoRows)
    }

    /// Whether this is a serialization failure that may succeed on retry.
    ///
    /// SQLSTATE `40001` is authoritative. Drivers that only surface the
    /// server message are matched on "could not serialize access".
    pub fn is_serialization_failure(&self) -> bool {
        match self.root() {
            Error::Query(q) => {
                q.kind == QueryErrorKind::Serialization
                    || q.sqlstate.as_deref() == Some("40001")
                    || q.message.contains(SERIALIZATION_FAILURE_TEXT)
            }
            // The retry loop's own give-up error quotes the last failure.
            Error::Transaction(_) => false,
            other => other.to_string().contains(SERIALIZATION_FAILURE_TEXT),
        }
    }

    pub fn is_within_transaction(&self) -> bool {
        self.transaction_kind() == Some(TransactionErrorKind::WithinTransaction)
    }

    pub fn is_not_within_transaction(&self) -> bool {
        self.transaction_kind() == Some(TransactionErrorKind::NotWithinTransaction)
    }

    pub fn transaction_kind(&self) -> Option<TransactionErrorKind> {
        match self.root() {
            Error::Transaction(t) => Some(t.kind),
            _ => None,
        }
    }

    pub fn mapping_kind(&self) -> Option<MappingErrorKind> {
        match self.root() {
            Error::Mapping(m) => Some(m.kind),
            _ => None,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self.root(), Error::Connection(_))
    }

    pub fn is_invalid_identifier(&self) -> bool {
        matches!(self.root(), Error::InvalidIdentifier(_))
    }
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "{e}"),
            Error::Mapping(e) => write!(f, "{}", e.message),
            Error::Scan(e) => write!(f, "{e}"),
            Error::Transaction(e) => write!(f, "{e}"),
            Error::InvalidIdentifier(name) => write!(f, "invalid identifier: {name:?}"),
            Error::NoRows => write!(f, "no rows in result set"),
            Error::Config(msg) => write!(f, "Configuration error: {msg}"),
            Error::WithQuery { query, source } => write!(f, "{source} from query: {query}"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Query error: {}", self.message)?;
        if let Some(code) = &self.sqlstate {
            write!(f, " (SQLSTATE {code})")?;
        }
        if let Some(sql) = &self.sql {
            write!(f, " from query: {sql}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot scan {} into {}", self.found, self.expected)?;
        if let Some(column) = &self.column {
            write!(f, " (column {column:?})")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            Error::Transaction(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn std::error::Error + 'static)),
            Error::WithQuery { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: err.to_string(),
            source: Some(Arc::new(err)),
        })
    }
}

/// Result type alias for sqldb operations.
pub type Result<T> = std::result::Result<T, Error>;
