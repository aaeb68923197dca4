//! Lookup keys and their runtime types.

use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput};

/// A lookup key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Long(i64),
    Int(i32),
    Text(String),
}

/// Runtime type of a [`Key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Long,
    Int,
    Text,
}

impl Key {
    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Long(_) => KeyKind::Long,
            Self::Int(_) => KeyKind::Int,
            Self::Text(_) => KeyKind::Text,
        }
    }
}

impl ToSql for Key {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Long(v) => ToSqlOutput::from(*v),
            Self::Int(v) => ToSqlOutput::from(*v),
            Self::Text(v) => ToSqlOutput::from(v.as_str()),
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Long => "64-bit integer",
            Self::Int => "32-bit integer",
            Self::Text => "string",
        })
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}
