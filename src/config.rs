//! Configuration parsing for the Cachet store.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Sensible defaults for everything but the database URL

use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::storage::batch::BatchConfig;

/// Longest accepted reaper interval: one day.
pub const MAX_REAPER_INTERVAL_MS: u64 = 86_400_000;

/// Cachet: a durable object cache backed by SQLite.
#[derive(Parser, Debug, Clone)]
#[command(name = "cachet")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Database URL (sqlite://path/to/file.db or a plain path)
    #[arg(long, env = "CACHET_URL")]
    pub url: Option<String>,

    /// Database username, for dialects that authenticate
    #[arg(long, env = "CACHET_USERNAME")]
    pub username: Option<String>,

    /// Database password, for dialects that authenticate
    #[arg(long, env = "CACHET_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// SQL dialect / driver
    #[arg(long, env = "CACHET_DIALECT", default_value = "sqlite")]
    pub dialect: String,

    /// Schema management (none, validate, update, create, create-drop)
    #[arg(long, env = "CACHET_SCHEMA_MODE", default_value = "update")]
    pub schema_mode: String,

    /// Row cache provider (none, memory)
    #[arg(long, env = "CACHET_CACHE_PROVIDER", default_value = "none")]
    pub cache_provider: String,

    /// Log every SQL statement
    #[arg(long, env = "CACHET_SHOW_SQL")]
    pub show_sql: bool,

    /// Managed entity count at which a session is flushed and cleared
    #[arg(long, env = "CACHET_ENTITY_CLEAR_THRESHOLD", default_value_t = 100)]
    pub entity_clear_threshold: usize,

    /// How often to reclaim sessions of terminated workers, in milliseconds
    #[arg(long, env = "CACHET_REAPER_INTERVAL_MS", default_value_t = 10_000)]
    pub reaper_interval_ms: u64,

    /// Maximum number of pooled connections, i.e. reads or transactions in flight at once
    #[arg(long, env = "CACHET_MAX_SESSIONS", default_value_t = 16)]
    pub max_sessions: u32,

    /// How long to wait on a locked database or a free connection, in milliseconds
    #[arg(long, env = "CACHET_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    pub busy_timeout_ms: u64,

    /// Rows fetched per page by streaming iterators
    #[arg(long, env = "CACHET_FETCH_SIZE", default_value_t = 100)]
    pub fetch_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
}

impl Dialect {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            _ => Err(ConfigError::UnsupportedDialect(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
        }
    }

    /// SQLite has no authentication layer.
    pub fn requires_credentials(self) -> bool {
        match self {
            Self::Sqlite => false,
        }
    }

    /// Extract the database file path from a connection URL.
    pub fn database_path(self, url: &str) -> PathBuf {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        PathBuf::from(path)
    }
}

/// What to do with the registered tables at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaMode {
    /// Leave the schema alone.
    None,
    /// Fail if a registered table is missing.
    Validate,
    /// Create missing tables and indexes.
    Update,
    /// Drop and recreate every registered table.
    Create,
    /// As `Create`, and drop the tables again at shutdown.
    CreateDrop,
}

impl SchemaMode {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "none" => Ok(Self::None),
            "validate" => Ok(Self::Validate),
            "update" => Ok(Self::Update),
            "create" => Ok(Self::Create),
            "create-drop" => Ok(Self::CreateDrop),
            _ => Err(ConfigError::UnknownSchemaMode(name.to_string())),
        }
    }
}

/// Shared row cache used for unique lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheProvider {
    None,
    Memory,
}

impl CacheProvider {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "none" => Ok(Self::None),
            "memory" => Ok(Self::Memory),
            _ => Err(ConfigError::UnknownCacheProvider(name.to_string())),
        }
    }
}

/// Validated configuration, ready to build a store from.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub dialect: Dialect,
    pub schema_mode: SchemaMode,
    pub cache_provider: CacheProvider,
    pub show_sql: bool,
    pub batch: BatchConfig,
    pub reaper_interval: Duration,
    pub max_sessions: u32,
    pub busy_timeout: Duration,
    pub fetch_size: usize,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Default configuration pointing at the given SQLite file.
    pub fn for_database(path: impl AsRef<Path>) -> Self {
        Self {
            url: Some(format!("sqlite://{}", path.as_ref().display())),
            ..Self::default()
        }
    }

    /// Check every option and resolve it into [`Settings`].
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let url = self
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::MissingUrl)?;

        let dialect = Dialect::parse(&self.dialect)?;
        if dialect.requires_credentials() && (self.username.is_none() || self.password.is_none()) {
            return Err(ConfigError::MissingCredentials {
                dialect: dialect.name(),
            });
        }

        if self.entity_clear_threshold == 0 {
            return Err(ConfigError::NonPositive {
                name: "entity_clear_threshold",
            });
        }
        if self.reaper_interval_ms == 0 {
            return Err(ConfigError::NonPositive {
                name: "reaper_interval_ms",
            });
        }
        if self.reaper_interval_ms > MAX_REAPER_INTERVAL_MS {
            return Err(ConfigError::TooLarge {
                name: "reaper_interval_ms",
                max: MAX_REAPER_INTERVAL_MS,
            });
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::NonPositive {
                name: "max_sessions",
            });
        }
        if self.busy_timeout_ms == 0 {
            return Err(ConfigError::NonPositive {
                name: "busy_timeout_ms",
            });
        }
        if self.fetch_size == 0 {
            return Err(ConfigError::NonPositive { name: "fetch_size" });
        }

        Ok(Settings {
            database_path: dialect.database_path(url),
            dialect,
            schema_mode: SchemaMode::parse(&self.schema_mode)?,
            cache_provider: CacheProvider::parse(&self.cache_provider)?,
            show_sql: self.show_sql,
            batch: BatchConfig::from_config(self.entity_clear_threshold),
            reaper_interval: Duration::from_millis(self.reaper_interval_ms),
            max_sessions: self.max_sessions,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            fetch_size: self.fetch_size,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            dialect: "sqlite".into(),
            schema_mode: "update".into(),
            cache_provider: "none".into(),
            show_sql: false,
            entity_clear_threshold: 100,
            reaper_interval_ms: 10_000,
            max_sessions: 16,
            busy_timeout_ms: 5_000,
            fetch_size: 100,
            log_level: "info".into(),
        }
    }
}
