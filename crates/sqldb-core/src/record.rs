//! Record reflection: the compile-time mapping between Rust structs and
//! table columns.
//!
//! `#[derive(Record)]` (from `sqldb-macros`) implements [`Record`] for a
//! struct. The trait exposes the table identity, the static per-field
//! metadata, and three collectors that walk the struct in declaration order
//! (recursing into embedded fragments): column metadata, column values, and
//! mutable scan targets. Everything else in this module is built on those
//! collectors, so the column order is the same for all of them.

use crate::error::{Error, Result};
use crate::scan::ScanValue;
use crate::value::Value;
use std::collections::HashMap;
use std::collections::hash_map;

/// Metadata about one mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnInfo {
    /// Database column name
    pub name: &'static str,
    /// Rust field name the column is read from and written to
    pub field: &'static str,
    /// Part of the primary key
    pub primary_key: bool,
    /// Never written by INSERT / UPDATE / UPSERT
    pub read_only: bool,
    /// The database supplies a default value
    pub has_default: bool,
}

impl ColumnInfo {
    pub const fn new(name: &'static str, field: &'static str) -> Self {
        Self {
            name,
            field,
            primary_key: false,
            read_only: false,
            has_default: false,
        }
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub const fn has_default(mut self, value: bool) -> Self {
        self.has_default = value;
        self
    }
}

/// How a single struct field participates in mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMapping {
    /// Skipped entirely
    Unmapped,
    /// A record-valued field whose columns are mapped at the outer level
    Embedded,
    /// A column
    Column(ColumnInfo),
}

/// Static metadata about one struct field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Declaration index within the struct
    pub index: usize,
    pub mapping: FieldMapping,
}

impl FieldInfo {
    pub const fn new(name: &'static str, index: usize, mapping: FieldMapping) -> Self {
        Self {
            name,
            index,
            mapping,
        }
    }
}

/// A column together with the field path leading to it.
///
/// The path holds one declaration index per struct level; embedded fragments
/// add a level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedColumn {
    pub info: ColumnInfo,
    pub path: Vec<usize>,
}

impl MappedColumn {
    pub fn new(info: ColumnInfo, prefix: &[usize], index: usize) -> Self {
        let mut path = Vec::with_capacity(prefix.len() + 1);
        path.extend_from_slice(prefix);
        path.push(index);
        Self { info, path }
    }
}

/// A mutable pointer into a record field, keyed by column name.
pub struct ScanTarget<'a> {
    pub column: &'static str,
    pub target: &'a mut dyn ScanValue,
}

impl<'a> ScanTarget<'a> {
    pub fn new(column: &'static str, target: &'a mut dyn ScanValue) -> Self {
        Self { column, target }
    }
}

impl std::fmt::Debug for ScanTarget<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanTarget")
            .field("column", &self.column)
            .finish_non_exhaustive()
    }
}

/// A struct mapped to table columns.
///
/// Normally derived:
///
/// ```ignore
/// #[derive(Debug, Default, Record)]
/// #[db(table = "users")]
/// struct User {
///     #[db("id", pk, default)]
///     id: i64,
///     name: String,
///     #[db(flatten)]
///     audit: Audit,
///     #[db(skip)]
///     scratch: Vec<u8>,
/// }
/// ```
///
/// The three collectors must visit columns in the same order.
pub trait Record {
    /// Table name declared with `#[db(table = "...")]`.
    const TABLE: Option<&'static str>;

    /// Metadata for the struct's own fields, in declaration order.
    fn record_fields() -> &'static [FieldInfo];

    /// Append every mapped column, recursing into embedded fragments.
    fn collect_columns(prefix: &[usize], out: &mut Vec<MappedColumn>);

    /// Append the value of every mapped column.
    fn collect_values(&self, out: &mut Vec<Value>);

    /// Append a scan target for every mapped column.
    fn collect_targets<'a>(&'a mut self, out: &mut Vec<ScanTarget<'a>>);
}

// ============================================================================
// Column filters
// ============================================================================

/// A predicate that excludes columns from a generated statement.
///
/// A list of filters is applied as logical OR: the first filter that
/// matches drops the column. Filter lists are hashable so that they can be
/// part of a statement cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnFilter {
    /// Drop columns whose value is supplied by the database
    IgnoreHasDefault,
    /// Drop primary-key columns
    IgnorePrimaryKey,
    /// Drop read-only columns
    IgnoreReadOnly,
    /// Drop columns whose current value is NULL
    IgnoreNull,
    /// Drop columns whose current value is NULL or the zero value
    IgnoreNullOrZero,
    /// Drop columns with a default whose current value is NULL or zero
    IgnoreHasDefaultAndNullOrZero,
    /// Drop the named columns
    IgnoreColumns(Vec<String>),
    /// Keep only the named columns
    OnlyColumns(Vec<String>),
    /// Drop columns backed by the named struct fields
    IgnoreStructFields(Vec<String>),
    /// Keep only columns backed by the named struct fields
    OnlyStructFields(Vec<String>),
}

impl ColumnFilter {
    pub fn ignore_columns<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ColumnFilter::IgnoreColumns(names.into_iter().map(Into::into).collect())
    }

    pub fn only_columns<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ColumnFilter::OnlyColumns(names.into_iter().map(Into::into).collect())
    }

    pub fn ignore_struct_fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ColumnFilter::IgnoreStructFields(names.into_iter().map(Into::into).collect())
    }

    pub fn only_struct_fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ColumnFilter::OnlyStructFields(names.into_iter().map(Into::into).collect())
    }

    /// Whether this filter drops `column` holding `value`.
    pub fn ignores(&self, column: &ColumnInfo, value: &Value) -> bool {
        let contains = |names: &[String], name: &str| names.iter().any(|n| n == name);
        match self {
            ColumnFilter::IgnoreHasDefault => column.has_default,
            ColumnFilter::IgnorePrimaryKey => column.primary_key,
            ColumnFilter::IgnoreReadOnly => column.read_only,
            ColumnFilter::IgnoreNull => value.is_null(),
            ColumnFilter::IgnoreNullOrZero => value.is_null_or_zero(),
            ColumnFilter::IgnoreHasDefaultAndNullOrZero => {
                column.has_default && value.is_null_or_zero()
            }
            ColumnFilter::IgnoreColumns(names) => contains(names, column.name),
            ColumnFilter::OnlyColumns(names) => !contains(names, column.name),
            ColumnFilter::IgnoreStructFields(names) => contains(names, column.field),
            ColumnFilter::OnlyStructFields(names) => !contains(names, column.field),
        }
    }

    /// Whether the outcome of this filter depends on the record's values.
    pub const fn depends_on_value(&self) -> bool {
        matches!(
            self,
            ColumnFilter::IgnoreNull
                | ColumnFilter::IgnoreNullOrZero
                | ColumnFilter::IgnoreHasDefaultAndNullOrZero
        )
    }
}

/// Apply a filter list to one column.
pub fn is_ignored(filters: &[ColumnFilter], column: &ColumnInfo, value: &Value) -> bool {
    filters.iter().any(|f| f.ignores(column, value))
}

// ============================================================================
// Reflector operations
// ============================================================================

/// Table name of `T`, or an error when the type declares none.
pub fn table_name<T: Record>() -> Result<&'static str> {
    T::TABLE.ok_or_else(|| {
        let record = std::any::type_name::<T>();
        Error::mapping(
            crate::error::MappingErrorKind::NoTableName,
            record,
            format!("no table-name marker on {record}"),
        )
    })
}

/// How the struct field `field` of `T` is mapped, or `None` when `T` has no
/// such field.
pub fn map_field<T: Record>(field: &str) -> Option<FieldMapping> {
    T::record_fields()
        .iter()
        .find(|f| f.name == field)
        .map(|f| f.mapping)
}

/// All mapped columns of `T` with their field paths.
pub fn mapped_columns<T: Record>() -> Vec<MappedColumn> {
    let mut out = Vec::new();
    T::collect_columns(&[], &mut out);
    out
}

/// All mapped columns of `T` in declaration order.
pub fn columns<T: Record>() -> Vec<ColumnInfo> {
    mapped_columns::<T>().into_iter().map(|c| c.info).collect()
}

/// Primary-key columns of `T` in declaration order.
pub fn primary_key_columns<T: Record>() -> Vec<ColumnInfo> {
    columns::<T>()
        .into_iter()
        .filter(|c| c.primary_key)
        .collect()
}

/// Current values of all mapped columns of `record`.
pub fn values<T: Record>(record: &T) -> Vec<Value> {
    let mut out = Vec::new();
    record.collect_values(&mut out);
    out
}

/// Columns and values of `record` that pass `filters`.
pub fn columns_and_values<T: Record>(
    record: &T,
    filters: &[ColumnFilter],
) -> (Vec<ColumnInfo>, Vec<Value>) {
    let (columns, _, values) = columns_field_indices_and_values(record, filters);
    (columns, values)
}

/// Like [`columns_and_values`] but also returns the field path of every
/// column.
pub fn columns_field_indices_and_values<T: Record>(
    record: &T,
    filters: &[ColumnFilter],
) -> (Vec<ColumnInfo>, Vec<Vec<usize>>, Vec<Value>) {
    let mapped = mapped_columns::<T>();
    let all_values = values(record);
    debug_assert_eq!(mapped.len(), all_values.len());

    let mut columns = Vec::with_capacity(mapped.len());
    let mut paths = Vec::with_capacity(mapped.len());
    let mut values = Vec::with_capacity(mapped.len());
    for (column, value) in mapped.into_iter().zip(all_values) {
        if is_ignored(filters, &column.info, &value) {
            continue;
        }
        columns.push(column.info);
        paths.push(column.path);
        values.push(value);
    }
    (columns, paths, values)
}

/// Scan targets into `record` for each requested column, in request order.
///
/// Fails when a requested column is not mapped by `T` or is requested more
/// than once.
pub fn column_pointers_for<'a, T: Record, S: AsRef<str>>(
    record: &'a mut T,
    column_names: &[S],
) -> Result<Vec<&'a mut dyn ScanValue>> {
    let type_name = std::any::type_name::<T>();
    let mut targets = Vec::new();
    record.collect_targets(&mut targets);

    let mut by_name: HashMap<&'static str, Option<&'a mut dyn ScanValue>> =
        HashMap::with_capacity(targets.len());
    for ScanTarget { column, target } in targets {
        // First mapping wins when embedded fragments repeat a column name.
        if let hash_map::Entry::Vacant(slot) = by_name.entry(column) {
            slot.insert(Some(target));
        }
    }

    let mut pointers = Vec::with_capacity(column_names.len());
    for name in column_names {
        let name = name.as_ref();
        match by_name.get_mut(name) {
            Some(slot) => match slot.take() {
                Some(target) => pointers.push(target),
                None => return Err(Error::duplicate_column(type_name, name)),
            },
            None => return Err(Error::unmapped_column(type_name, name)),
        }
    }
    Ok(pointers)
}

/// Scan one result row into `record`, resolving columns by name.
pub fn scan_record<T: Record, S: AsRef<str>>(
    record: &mut T,
    column_names: &[S],
    row: &[Value],
) -> Result<()> {
    if column_names.len() != row.len() {
        return Err(Error::column_count(column_names.len(), row.len()));
    }
    let pointers = column_pointers_for(record, column_names)?;
    for ((target, value), name) in pointers.into_iter().zip(row).zip(column_names) {
        target
            .scan_value(value)
            .map_err(|e| e.in_column(name.as_ref()))?;
    }
    Ok(())
}

// ============================================================================
// Values
// ============================================================================

/// An unordered mapping from column name to value.
///
/// Statements built from `Values` list the columns sorted by name, so the
/// same key set always produces the same query text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values(HashMap<String, Value>);

impl Values {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(column.into(), value.into())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.0.remove(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Column names in ascending order with their values in the same order.
    pub fn sorted_columns_and_values(&self) -> (Vec<&str>, Vec<Value>) {
        let mut entries: Vec<(&str, &Value)> = self.iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(name, value)| (name, value.clone()))
            .unzip()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Values {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<HashMap<String, Value>> for Values {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map)
    }
}
