//! SQLite schema management.
//!
//! Tables are derived from the registered row types rather than written
//! by hand. What happens to them at startup is governed by
//! [`SchemaMode`].

use rusqlite::Connection;
use std::time::Duration;

use crate::config::SchemaMode;
use crate::error::StoreError;
use crate::model::{primary_key_index, Column, Entity, Row};

/// Pragmas applied to every pooled connection.
const PRAGMAS: &str = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
"#;

/// Apply connection pragmas.
pub fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(PRAGMAS)
}

/// Table definition for one registered row type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub table: &'static str,
    pub columns: &'static [Column],
    /// Non-key columns that get a secondary index.
    pub indexed: Vec<&'static str>,
}

impl TableDef {
    /// Table for a row type with no secondary indexes.
    pub fn of_row<R: Row>() -> Self {
        Self {
            table: R::TABLE,
            columns: R::COLUMNS,
            indexed: Vec::new(),
        }
    }

    /// Table for an entity's row type, indexed by each of its key columns.
    pub fn of_entity<T: Entity>() -> Self {
        let mut def = Self::of_row::<T::Row>();
        for (_, column) in T::KEY_COLUMNS {
            let is_pk = def
                .columns
                .iter()
                .any(|c| c.name == *column && c.primary_key);
            if !is_pk && !def.indexed.contains(column) {
                def.indexed.push(*column);
            }
        }
        def
    }

    /// Check that the definition is internally consistent.
    pub fn check(&self) -> Result<(), StoreError> {
        primary_key_index(self.table, self.columns)?;
        for column in &self.indexed {
            if !self.columns.iter().any(|c| c.name == *column) {
                return Err(StoreError::SchemaMismatch(format!(
                    "key column {column} is not a column of table {}",
                    self.table
                )));
            }
        }
        Ok(())
    }

    fn create_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", quote_ident(c.name), c.sql_type.as_sql());
                if c.primary_key {
                    def.push_str(" PRIMARY KEY");
                }
                def
            })
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(self.table),
            columns.join(", ")
        )
    }

    fn index_sql(&self) -> Vec<String> {
        self.indexed
            .iter()
            .map(|column| {
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote_ident(&format!("idx_{}_{}", self.table, column)),
                    quote_ident(self.table),
                    quote_ident(column)
                )
            })
            .collect()
    }
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Apply the schema mode to the given tables.
pub fn apply_schema(
    conn: &Connection,
    mode: SchemaMode,
    tables: &[TableDef],
) -> Result<(), StoreError> {
    match mode {
        SchemaMode::None => Ok(()),
        SchemaMode::Validate => validate_schema(conn, tables),
        SchemaMode::Update => create_tables(conn, tables),
        SchemaMode::Create | SchemaMode::CreateDrop => {
            drop_tables(conn, tables)?;
            create_tables(conn, tables)
        }
    }
}

fn create_tables(conn: &Connection, tables: &[TableDef]) -> Result<(), StoreError> {
    for def in tables {
        conn.execute(&def.create_sql(), [])?;
        for sql in def.index_sql() {
            conn.execute(&sql, [])?;
        }
        tracing::debug!(table = def.table, "Ensured table");
    }
    Ok(())
}

/// Drop every given table.
pub fn drop_tables(conn: &Connection, tables: &[TableDef]) -> Result<(), StoreError> {
    for def in tables {
        conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(def.table)), [])?;
        tracing::debug!(table = def.table, "Dropped table");
    }
    Ok(())
}

fn validate_schema(conn: &Connection, tables: &[TableDef]) -> Result<(), StoreError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    for def in tables {
        let present = stmt
            .query_map([def.table], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if present.is_empty() {
            return Err(StoreError::SchemaMismatch(format!(
                "table {} does not exist",
                def.table
            )));
        }
        for column in def.columns {
            if !present.iter().any(|p| p == column.name) {
                return Err(StoreError::SchemaMismatch(format!(
                    "table {} is missing column {}",
                    def.table, column.name
                )));
            }
        }
    }
    Ok(())
}
