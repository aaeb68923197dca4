//! Mapping between domain objects and storable rows.
//!
//! A domain type implements [`Entity`], naming its row type and the
//! columns its keys are looked up by. The row type implements [`Row`],
//! describing its table and converting to and from plain SQLite values.
//! Everything else in the crate only ever sees these two traits.

pub mod key;
pub mod marker;

pub use key::{Key, KeyKind};
pub use marker::CompletenessMarker;

use rusqlite::types::{FromSql, Value, ValueRef};

use crate::error::StoreError;

/// SQLite storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    Real,
    Text,
    Blob,
}

impl SqlType {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        }
    }
}

/// A single column of a row table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub primary_key: bool,
}

impl Column {
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            sql_type,
            primary_key: false,
        }
    }

    /// The identity column; rows are merged and deleted by it.
    pub const fn primary_key(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            sql_type,
            primary_key: true,
        }
    }
}

/// Storable row representation of a domain object.
///
/// `COLUMNS` must contain exactly one primary-key column, and
/// `to_values` must return one value per column in the same order.
pub trait Row: Sized + Send + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static [Column];

    fn to_values(&self) -> Vec<Value>;

    fn from_values(values: RowValues) -> Result<Self, StoreError>;

    fn image(&self) -> RowImage {
        RowImage {
            table: Self::TABLE,
            columns: Self::COLUMNS,
            values: self.to_values(),
        }
    }
}

/// A domain object that can be cached in the store.
pub trait Entity: Sized + Send + 'static {
    /// Stable type identity, used to key completeness markers.
    const NAME: &'static str;

    /// Which indexed column each supported key type is looked up by.
    ///
    /// Only the first entry for a given [`KeyKind`] is consulted.
    const KEY_COLUMNS: &'static [(KeyKind, &'static str)];

    type Row: Row;

    fn to_row(&self) -> Self::Row;

    fn from_row(row: Self::Row) -> Self;

    fn index_column(kind: KeyKind) -> Option<&'static str> {
        Self::KEY_COLUMNS
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, column)| *column)
    }

    fn key_kinds() -> Vec<KeyKind> {
        let mut kinds: Vec<KeyKind> = Vec::with_capacity(Self::KEY_COLUMNS.len());
        for (kind, _) in Self::KEY_COLUMNS {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        kinds
    }
}

/// Resolve the indexed column for `key`, or fail with a diagnostic.
pub(crate) fn resolve_column<T: Entity>(key: &Key) -> Result<&'static str, StoreError> {
    T::index_column(key.kind())
        .ok_or_else(|| StoreError::unsupported_key(T::NAME, key.kind(), &T::key_kinds()))
}

/// Type-erased row, as held in a session's persistence context.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
    pub table: &'static str,
    pub columns: &'static [Column],
    pub values: Vec<Value>,
}

impl RowImage {
    /// Value of the primary-key column.
    pub fn identity(&self) -> Result<&Value, StoreError> {
        let index = primary_key_index(self.table, self.columns)?;
        self.values.get(index).ok_or_else(|| {
            StoreError::InvalidArgument(format!(
                "{} row has {} values for {} columns",
                self.table,
                self.values.len(),
                self.columns.len()
            ))
        })
    }
}

/// Position of the single primary-key column.
pub(crate) fn primary_key_index(
    table: &'static str,
    columns: &[Column],
) -> Result<usize, StoreError> {
    let mut keys = columns.iter().enumerate().filter(|(_, c)| c.primary_key);
    match (keys.next(), keys.next()) {
        (Some((index, _)), None) => Ok(index),
        (None, _) => Err(StoreError::SchemaMismatch(format!(
            "table {table} declares no primary key column"
        ))),
        (Some(_), Some(_)) => Err(StoreError::SchemaMismatch(format!(
            "table {table} declares more than one primary key column"
        ))),
    }
}

/// Sequential reader over a fetched row's values.
pub struct RowValues {
    table: &'static str,
    columns: &'static [Column],
    values: std::vec::IntoIter<Value>,
    index: usize,
}

impl RowValues {
    pub fn new(table: &'static str, columns: &'static [Column], values: Vec<Value>) -> Self {
        Self {
            table,
            columns,
            values: values.into_iter(),
            index: 0,
        }
    }

    /// Decode the next column value.
    pub fn next<T: FromSql>(&mut self) -> Result<T, StoreError> {
        let column = self.columns.get(self.index).map_or("?", |c| c.name);
        self.index += 1;

        let value = self.values.next().ok_or_else(|| StoreError::DataIntegrity {
            table: self.table,
            reason: format!("missing value for column {column}"),
        })?;

        T::column_result(ValueRef::from(&value)).map_err(|e| StoreError::DataIntegrity {
            table: self.table,
            reason: format!("column {column}: {e}"),
        })
    }
}
