//! Query formatting and statement building for sqldb.
//!
//! - [`format`]: identifier validation, placeholders, literal quoting and
//!   debug rendering of queries with their arguments.
//! - [`builder`]: the statements used by record DML (`SELECT` by primary
//!   key, `INSERT`, `ON CONFLICT` variants and `UPDATE`).
//!
//! Nothing here talks to a database; see `sqldb-session` for execution.

pub mod builder;
pub mod format;

pub use builder::{QueryBuilder, StdQueryBuilder};
pub use format::{
    QueryFormatter, StdQueryFormatter, format_query, format_value, quote_literal,
    wrap_error_with_query,
};
