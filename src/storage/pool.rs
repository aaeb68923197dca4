//! Session factory backed by an r2d2 connection pool.
//!
//! Uses r2d2 with r2d2_sqlite for pooled connections. SQLite WAL mode
//! lets readers proceed while one session holds the write lock; writers
//! wait on each other up to the configured busy timeout.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::time::Duration;

use super::schema::{apply_pragmas, apply_schema, drop_tables, TableDef};
use super::session::Session;
use crate::config::{SchemaMode, Settings};
use crate::error::StoreError;

/// Opens sessions on the configured database.
pub struct SessionFactory {
    pool: Pool<SqliteConnectionManager>,
    show_sql: bool,
}

impl SessionFactory {
    /// Create the pool and open one connection to prove the database
    /// is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn new(settings: &Settings) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(&settings.database_path);

        let pool = Pool::builder()
            .max_size(settings.max_sessions)
            .min_idle(Some(1))
            .connection_timeout(settings.busy_timeout)
            .connection_customizer(Box::new(SessionConnectionCustomizer {
                busy_timeout: settings.busy_timeout,
            }))
            .build(manager)?;

        tracing::info!(
            path = %settings.database_path.display(),
            max_sessions = settings.max_sessions,
            "Session factory ready"
        );

        Ok(Self {
            pool,
            show_sql: settings.show_sql,
        })
    }

    /// Open a new session. It borrows pooled connections on demand, so
    /// any number of sessions can be open at once.
    pub fn open_session(&self) -> Session {
        Session::new(self.pool.clone(), self.show_sql)
    }

    /// Apply the schema mode to the registered tables.
    pub fn apply_schema(&self, mode: SchemaMode, tables: &[TableDef]) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        apply_schema(&conn, mode, tables)?;
        tracing::info!(mode = ?mode, tables = tables.len(), "Schema applied");
        Ok(())
    }

    /// Drop the registered tables (create-drop teardown).
    pub fn drop_schema(&self, tables: &[TableDef]) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        drop_tables(&conn, tables)
    }

    /// Get the current pool state for monitoring.
    pub fn state(&self) -> r2d2::State {
        self.pool.state()
    }
}

/// Connection customizer that applies session pragmas.
#[derive(Debug)]
struct SessionConnectionCustomizer {
    busy_timeout: Duration,
}

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error>
    for SessionConnectionCustomizer
{
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        apply_pragmas(conn, self.busy_timeout)
    }
}
