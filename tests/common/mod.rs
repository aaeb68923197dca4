//! Test utilities and entity fixtures for Cachet tests.
//!
//! Provides:
//! - Temporary database fixtures
//! - Sample entity types keyed by 64-bit, 32-bit and string keys
//! - Polling helper for background behavior

#![allow(dead_code)]

use cachet::observability::tracing::init_test_tracing;
use cachet::{Column, Config, Entity, Key, KeyKind, Row, RowValues, SqlType, Store, StoreError};
use rusqlite::types::Value;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Test fixture that manages a temporary database directory.
///
/// Creating one also installs the test log subscriber. The directory
/// is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for test database
    pub temp_dir: TempDir,
    /// Path to the database file
    pub db_path: PathBuf,
}

impl TestFixture {
    pub fn new() -> Self {
        init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");
        Self { temp_dir, db_path }
    }

    /// Default configuration for this fixture's database.
    pub fn config(&self) -> Config {
        Config::for_database(&self.db_path)
    }

    /// A store with every sample entity registered.
    pub fn store(&self) -> Store {
        self.store_with(self.config())
    }

    pub fn store_with(&self, config: Config) -> Store {
        Store::builder(config)
            .register::<Summoner>()
            .register::<Item>()
            .build()
            .expect("failed to build store")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a condition to become true with timeout.
///
/// Returns `true` if the condition was met before the timeout expired.
pub fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummonerRow {
    pub id: i64,
    pub name: String,
    pub level: i64,
}

impl Row for SummonerRow {
    const TABLE: &'static str = "summoner";
    const COLUMNS: &'static [Column] = &[
        Column::primary_key("id", SqlType::Integer),
        Column::new("name", SqlType::Text),
        Column::new("level", SqlType::Integer),
    ];

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            Value::Text(self.name.clone()),
            Value::Integer(self.level),
        ]
    }

    fn from_values(mut values: RowValues) -> Result<Self, StoreError> {
        Ok(Self {
            id: values.next()?,
            name: values.next()?,
            level: values.next()?,
        })
    }
}

/// Looked up by 64-bit id or by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Summoner {
    pub id: i64,
    pub name: String,
    pub level: i64,
}

impl Entity for Summoner {
    const NAME: &'static str = "summoner";
    const KEY_COLUMNS: &'static [(KeyKind, &'static str)] =
        &[(KeyKind::Long, "id"), (KeyKind::Text, "name")];

    type Row = SummonerRow;

    fn to_row(&self) -> SummonerRow {
        SummonerRow {
            id: self.id,
            name: self.name.clone(),
            level: self.level,
        }
    }

    fn from_row(row: SummonerRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            level: row.level,
        }
    }
}

pub fn summoner(id: i64, name: &str) -> Summoner {
    Summoner {
        id,
        name: name.to_string(),
        level: 30,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemRow {
    pub id: i32,
    pub name: String,
    pub gold: Option<i64>,
}

impl Row for ItemRow {
    const TABLE: &'static str = "item";
    const COLUMNS: &'static [Column] = &[
        Column::primary_key("id", SqlType::Integer),
        Column::new("name", SqlType::Text),
        Column::new("gold", SqlType::Integer),
    ];

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(i64::from(self.id)),
            Value::Text(self.name.clone()),
            self.gold.map_or(Value::Null, Value::Integer),
        ]
    }

    fn from_values(mut values: RowValues) -> Result<Self, StoreError> {
        Ok(Self {
            id: values.next()?,
            name: values.next()?,
            gold: values.next()?,
        })
    }
}

/// Looked up by 32-bit id only.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: i32,
    pub name: String,
    pub gold: Option<i64>,
}

impl Entity for Item {
    const NAME: &'static str = "item";
    const KEY_COLUMNS: &'static [(KeyKind, &'static str)] = &[(KeyKind::Int, "id")];

    type Row = ItemRow;

    fn to_row(&self) -> ItemRow {
        ItemRow {
            id: self.id,
            name: self.name.clone(),
            gold: self.gold,
        }
    }

    fn from_row(row: ItemRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            gold: row.gold,
        }
    }
}

pub fn item(id: i32, name: &str) -> Item {
    Item {
        id,
        name: name.to_string(),
        gold: Some(i64::from(id) * 100),
    }
}

/// Keys for `store_all` when the caller has none.
pub fn no_keys(count: usize) -> Vec<Option<Key>> {
    vec![None; count]
}
