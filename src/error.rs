//! Error types for the object store.
//!
//! Configuration problems surface as [`ConfigError`] at startup and are
//! never retried. Everything that can go wrong afterwards is a
//! [`StoreError`].

use thiserror::Error;

use crate::model::KeyKind;

/// Invalid or incomplete store configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("database URL must be set")]
    MissingUrl,

    #[error("dialect {dialect} requires a username and password")]
    MissingCredentials { dialect: &'static str },

    #[error("unsupported SQL dialect: {0}")]
    UnsupportedDialect(String),

    #[error("unknown schema mode: {0} (expected none, validate, update, create or create-drop)")]
    UnknownSchemaMode(String),

    #[error("unknown cache provider: {0} (expected none or memory)")]
    UnknownCacheProvider(String),

    #[error("{name} must be greater than zero")]
    NonPositive { name: &'static str },

    #[error("{name} must be at most {max}")]
    TooLarge { name: &'static str, max: u64 },
}

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no database connection available: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No indexed column is declared for the key's runtime type.
    #[error("invalid key type {kind} for {entity}: {hint}")]
    UnsupportedKey {
        entity: &'static str,
        kind: KeyKind,
        hint: String,
    },

    #[error("query on {table}.{column} matched more than one row")]
    NonUniqueResult {
        table: &'static str,
        column: &'static str,
    },

    /// A stored row could not be decoded back into its row type.
    #[error("couldn't load {table} row from database: {reason}")]
    DataIntegrity { table: &'static str, reason: String },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("session registry has been shut down")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Build the diagnostic for a key whose runtime type has no indexed column.
    ///
    /// Numeric width mismatches are the usual cause, so when the entity
    /// accepts the other integer width the hint names it.
    pub(crate) fn unsupported_key(
        entity: &'static str,
        kind: KeyKind,
        supported: &[KeyKind],
    ) -> Self {
        let hint = match kind {
            KeyKind::Long if supported.contains(&KeyKind::Int) => {
                "this type is keyed by 32-bit integers, try an i32 key instead".to_string()
            }
            KeyKind::Int if supported.contains(&KeyKind::Long) => {
                "this type is keyed by 64-bit integers, try an i64 key instead".to_string()
            }
            _ if supported.is_empty() => "this type does not support keyed lookups".to_string(),
            _ => {
                let names: Vec<String> = supported.iter().map(ToString::to_string).collect();
                format!("supported key types are {}", names.join(", "))
            }
        };
        Self::UnsupportedKey { entity, kind, hint }
    }
}
