//! Generated-statement cache.
//!
//! Record DML builds the same statement for every record of a type, so the
//! query text, column list and primary-key positions are cached per
//! record type, statement kind, filter list and dialect. The dialect is
//! [`QueryBuilder::dialect`](sqldb_query::QueryBuilder::dialect), so
//! connections rendering SQL differently never share an entry.

use sqldb_core::{ColumnFilter, ColumnInfo, Result};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

static GLOBAL: LazyLock<QueryCache> = LazyLock::new(QueryCache::new);

/// Which statement a cache entry holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Insert,
    InsertUnique { on_conflict: String },
    Upsert,
    Update,
    SelectByPk,
}

/// Cache key; two keys differing in any component never share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub record: TypeId,
    pub kind: StatementKind,
    pub filters: Vec<ColumnFilter>,
    pub dialect: String,
}

impl CacheKey {
    pub fn new<R: 'static>(kind: StatementKind, filters: &[ColumnFilter], dialect: &str) -> Self {
        Self {
            record: TypeId::of::<R>(),
            kind,
            filters: filters.to_vec(),
            dialect: dialect.to_string(),
        }
    }

    /// Whether the column set depends on record values, which makes the
    /// statement uncacheable.
    pub fn is_value_dependent(&self) -> bool {
        self.filters.iter().any(ColumnFilter::depends_on_value)
    }
}

/// A generated statement.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedStatement {
    pub query: String,
    /// Columns in argument order
    pub columns: Vec<ColumnInfo>,
    /// Positions of the primary-key columns within `columns`
    pub pk_positions: Vec<usize>,
}

impl CachedStatement {
    pub fn new(query: String, columns: Vec<ColumnInfo>) -> Self {
        let pk_positions = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect();
        Self {
            query,
            columns,
            pk_positions,
        }
    }
}

#[derive(Debug, Default)]
pub struct QueryCache {
    entries: RwLock<HashMap<CacheKey, Arc<CachedStatement>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache used by record DML.
    pub fn global() -> &'static QueryCache {
        &GLOBAL
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedStatement>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Return the cached statement for `key`, building and storing it on a
    /// miss. Value-dependent keys are built every time and never stored.
    pub fn get_or_build(
        &self,
        key: CacheKey,
        build: impl FnOnce() -> Result<CachedStatement>,
    ) -> Result<Arc<CachedStatement>> {
        if key.is_value_dependent() {
            return build().map(Arc::new);
        }
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let statement = Arc::new(build()?);
        tracing::debug!(kind = ?key.kind, query = %statement.query, "Caching generated statement");
        // A concurrent builder may have won; both produced the same text.
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(Arc::clone(entries.entry(key).or_insert(statement)))
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}
