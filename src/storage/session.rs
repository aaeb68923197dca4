//! Database sessions.
//!
//! A [`Session`] is a persistence context (the rows merged into it that
//! have not been detached yet) plus access to the connection pool. It
//! borrows a pooled connection only for the span of one read or one
//! [`SessionTx`], so an idle worker never pins a connection.
//!
//! A [`SessionTx`] flushes pending rows as upserts and rolls everything
//! back if it is dropped uncommitted.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::schema::quote_ident;
use crate::error::StoreError;
use crate::model::{primary_key_index, Column, Key, RowImage};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session number, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Hashable form of a primary-key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Identity {
    Null,
    Integer(i64),
    Real(u64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&Value> for Identity {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Integer(v) => Self::Integer(*v),
            Value::Real(v) => Self::Real(v.to_bits()),
            Value::Text(v) => Self::Text(v.clone()),
            Value::Blob(v) => Self::Blob(v.clone()),
        }
    }
}

#[derive(Debug)]
struct Managed {
    image: RowImage,
    dirty: bool,
}

/// Rows currently managed by a session, in merge order.
#[derive(Debug, Default)]
struct PersistenceContext {
    rows: Vec<Managed>,
    index: HashMap<(&'static str, Identity), usize>,
}

impl PersistenceContext {
    fn merge(&mut self, image: RowImage) -> Result<(), StoreError> {
        if image.values.len() != image.columns.len() {
            return Err(StoreError::InvalidArgument(format!(
                "{} row has {} values for {} columns",
                image.table,
                image.values.len(),
                image.columns.len()
            )));
        }
        let key = (image.table, Identity::from(image.identity()?));
        match self.index.get(&key) {
            Some(&slot) => {
                self.rows[slot] = Managed { image, dirty: true };
            }
            None => {
                self.index.insert(key, self.rows.len());
                self.rows.push(Managed { image, dirty: true });
            }
        }
        Ok(())
    }

    fn detach(&mut self, table: &'static str, identity: &Value) {
        if let Some(slot) = self.index.remove(&(table, Identity::from(identity))) {
            self.rows.remove(slot);
            for position in self.index.values_mut() {
                if *position > slot {
                    *position -= 1;
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }
}

type Connection = PooledConnection<SqliteConnectionManager>;

/// One worker's unit of work against the database.
pub struct Session {
    id: SessionId,
    pool: Option<Pool<SqliteConnectionManager>>,
    context: PersistenceContext,
    show_sql: bool,
}

impl Session {
    pub(crate) fn new(pool: Pool<SqliteConnectionManager>, show_sql: bool) -> Self {
        Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            pool: Some(pool),
            context: PersistenceContext::default(),
            show_sql,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.pool.is_some()
    }

    /// Number of rows currently managed by the session.
    pub fn entity_count(&self) -> usize {
        self.context.len()
    }

    /// Detach every row and let go of the pool. Later calls fail with
    /// [`StoreError::Closed`].
    pub fn close(&mut self) {
        if self.pool.take().is_some() {
            self.context.clear();
            tracing::debug!(session = %self.id, "Session closed");
        }
    }

    /// Borrow a connection from the pool until the returned guard drops.
    ///
    /// Waits up to the pool's connection timeout when every connection
    /// is in use.
    fn connection(&self) -> Result<Connection, StoreError> {
        let pool = self.pool.as_ref().ok_or(StoreError::Closed)?;
        Ok(pool.get()?)
    }

    /// Begin an immediate (write-locking) transaction on a freshly
    /// borrowed connection.
    pub fn begin(&mut self) -> Result<SessionTx<'_>, StoreError> {
        let conn = self.connection()?;
        log_sql(self.show_sql, self.id, "BEGIN IMMEDIATE");
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(SessionTx {
            conn: Some(conn),
            context: &mut self.context,
            session: self.id,
            show_sql: self.show_sql,
        })
    }

    /// Fetch the single row whose `column` equals `key`.
    ///
    /// Returns `None` when nothing matches and
    /// [`StoreError::NonUniqueResult`] when more than one row does.
    pub fn find_unique(
        &mut self,
        table: &'static str,
        columns: &'static [Column],
        column: &'static str,
        key: &Key,
    ) -> Result<Option<Vec<Value>>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 LIMIT 2",
            column_list(columns),
            quote_ident(table),
            quote_ident(column)
        );
        log_sql(self.show_sql, self.id, &sql);

        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut found = stmt
            .query_map([key], |row| read_values(row, 0, columns.len()))?
            .collect::<Result<Vec<_>, _>>()?;

        if found.len() > 1 {
            return Err(StoreError::NonUniqueResult { table, column });
        }
        Ok(found.pop())
    }

    /// Fetch up to `limit` rows with a rowid greater than `after`, in
    /// rowid order. Each row is returned with its rowid.
    pub fn scan_page(
        &mut self,
        table: &'static str,
        columns: &'static [Column],
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<(i64, Vec<Value>)>, StoreError> {
        let sql = format!(
            "SELECT rowid, {} FROM {} WHERE (?1 IS NULL OR rowid > ?1) ORDER BY rowid LIMIT ?2",
            column_list(columns),
            quote_ident(table)
        );
        log_sql(self.show_sql, self.id, &sql);

        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![after, limit], |row| {
                Ok((row.get::<_, i64>(0)?, read_values(row, 1, columns.len())?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fetch every row of a table, in rowid order.
    pub fn scan_all(
        &mut self,
        table: &'static str,
        columns: &'static [Column],
    ) -> Result<Vec<Vec<Value>>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY rowid",
            column_list(columns),
            quote_ident(table)
        );
        log_sql(self.show_sql, self.id, &sql);

        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([], |row| read_values(row, 0, columns.len()))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("managed", &self.context.len())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// A write transaction on a session.
///
/// Holds its pooled connection until it is committed, rolled back or
/// dropped. Dropping it without [`commit`](Self::commit) rolls the
/// transaction back and detaches every managed row.
pub struct SessionTx<'a> {
    conn: Option<Connection>,
    context: &'a mut PersistenceContext,
    session: SessionId,
    show_sql: bool,
}

impl SessionTx<'_> {
    /// Upsert a row by identity. The write is deferred until the next
    /// flush or commit.
    pub fn merge(&mut self, image: RowImage) -> Result<(), StoreError> {
        self.context.merge(image)
    }

    /// Delete a row by identity. Returns the number of rows removed.
    pub fn delete(&mut self, image: &RowImage) -> Result<usize, StoreError> {
        let identity = image.identity()?;
        self.context.detach(image.table, identity);

        let pk = primary_key_index(image.table, image.columns)?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(image.table),
            quote_ident(image.columns[pk].name)
        );
        log_sql(self.show_sql, self.session, &sql);

        let conn = self.conn.as_ref().ok_or(StoreError::Closed)?;
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt.execute([identity])?)
    }

    /// Number of rows currently managed by the session.
    pub fn entity_count(&self) -> usize {
        self.context.len()
    }

    /// Write every pending row to the database. Rows stay managed.
    pub fn flush(&mut self) -> Result<usize, StoreError> {
        let conn = self.conn.as_ref().ok_or(StoreError::Closed)?;
        let mut written = 0;
        for managed in self.context.rows.iter_mut().filter(|m| m.dirty) {
            let sql = upsert_sql(&managed.image)?;
            log_sql(self.show_sql, self.session, &sql);
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.execute(params_from_iter(managed.image.values.iter()))?;
            managed.dirty = false;
            written += 1;
        }
        Ok(written)
    }

    /// Detach every managed row. Unflushed rows are discarded.
    pub fn clear(&mut self) {
        self.context.clear();
    }

    /// Flush pending rows and commit.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.flush()?;
        let conn = self.conn.take().ok_or(StoreError::Closed)?;
        log_sql(self.show_sql, self.session, "COMMIT");
        if let Err(e) = conn.execute_batch("COMMIT") {
            self.conn = Some(conn);
            return Err(e.into());
        }
        Ok(())
    }

    /// Roll back explicitly, surfacing any rollback failure.
    pub fn rollback(mut self) -> Result<(), StoreError> {
        match self.conn.take() {
            Some(conn) => finish_rollback(&conn, self.show_sql, self.session),
            None => Ok(()),
        }
    }
}

impl Drop for SessionTx<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = finish_rollback(&conn, self.show_sql, self.session) {
                tracing::warn!(session = %self.session, error = %e, "Rollback on drop failed");
            }
        }
        self.context.clear();
    }
}

/// Roll back whatever transaction is open on the connection before it
/// goes back to the pool.
fn finish_rollback(conn: &Connection, show_sql: bool, session: SessionId) -> Result<(), StoreError> {
    if conn.is_autocommit() {
        return Ok(());
    }
    log_sql(show_sql, session, "ROLLBACK");
    conn.execute_batch("ROLLBACK")?;
    Ok(())
}

fn upsert_sql(image: &RowImage) -> Result<String, StoreError> {
    let pk = primary_key_index(image.table, image.columns)?;
    let names: Vec<String> = image.columns.iter().map(|c| quote_ident(c.name)).collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = names
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != pk)
        .map(|(_, name)| format!("{name} = excluded.{name}"))
        .collect();

    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        quote_ident(image.table),
        names.join(", "),
        placeholders.join(", "),
        names[pk],
        conflict
    ))
}

fn column_list(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_values(row: &rusqlite::Row<'_>, offset: usize, count: usize) -> rusqlite::Result<Vec<Value>> {
    (offset..offset + count).map(|i| row.get::<_, Value>(i)).collect()
}

fn log_sql(enabled: bool, session: SessionId, sql: &str) {
    if enabled {
        tracing::info!(target: "cachet::sql", session = %session, "{sql}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaMode;
    use crate::model::testing::{champion, ChampionRow};
    use crate::model::{Entity, Row};
    use crate::storage::schema::{apply_pragmas, apply_schema, TableDef};
    use r2d2::Pool;
    use std::time::Duration;
    use tempfile::TempDir;

    fn pool(dir: &TempDir) -> Pool<SqliteConnectionManager> {
        let manager = SqliteConnectionManager::file(dir.path().join("session.db"));
        let pool = Pool::builder().max_size(2).build(manager).unwrap();
        let conn = pool.get().unwrap();
        apply_pragmas(&conn, Duration::from_secs(1)).unwrap();
        apply_schema(
            &conn,
            SchemaMode::Update,
            &[TableDef::of_entity::<crate::model::testing::Champion>()],
        )
        .unwrap();
        pool
    }

    fn in_use(pool: &Pool<SqliteConnectionManager>) -> u32 {
        let state = pool.state();
        state.connections - state.idle_connections
    }

    fn count(session: &mut Session) -> usize {
        session
            .scan_all(ChampionRow::TABLE, ChampionRow::COLUMNS)
            .unwrap()
            .len()
    }

    #[test]
    fn test_merge_is_deferred_until_commit() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let mut session = Session::new(pool.clone(), false);

        let mut tx = session.begin().unwrap();
        tx.merge(champion(1, "Annie").to_row().image()).unwrap();
        tx.merge(champion(2, "Brand").to_row().image()).unwrap();
        assert_eq!(tx.entity_count(), 2);
        tx.commit().unwrap();

        assert_eq!(session.entity_count(), 0);
        assert_eq!(count(&mut session), 2);
    }

    #[test]
    fn test_merge_same_identity_replaces() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let mut session = Session::new(pool.clone(), false);

        let mut tx = session.begin().unwrap();
        tx.merge(champion(1, "Annie").to_row().image()).unwrap();
        tx.merge(champion(1, "Annie Hastur").to_row().image()).unwrap();
        assert_eq!(tx.entity_count(), 1);
        tx.commit().unwrap();

        let row = session
            .find_unique(ChampionRow::TABLE, ChampionRow::COLUMNS, "id", &Key::Long(1))
            .unwrap()
            .unwrap();
        assert_eq!(row[1], Value::Text("Annie Hastur".into()));
    }

    #[test]
    fn test_dropped_transaction_rolls_back_flushed_rows() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let mut session = Session::new(pool.clone(), false);

        {
            let mut tx = session.begin().unwrap();
            tx.merge(champion(1, "Annie").to_row().image()).unwrap();
            assert_eq!(tx.flush().unwrap(), 1);
            tx.clear();
        }

        assert_eq!(session.entity_count(), 0);
        assert_eq!(count(&mut session), 0);
    }

    #[test]
    fn test_delete_detaches_pending_row() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let mut session = Session::new(pool.clone(), false);

        let image = champion(3, "Cassiopeia").to_row().image();
        let mut tx = session.begin().unwrap();
        tx.merge(image.clone()).unwrap();
        assert_eq!(tx.delete(&image).unwrap(), 0);
        assert_eq!(tx.entity_count(), 0);
        tx.commit().unwrap();

        assert_eq!(count(&mut session), 0);
    }

    #[test]
    fn test_find_unique_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let mut session = Session::new(pool.clone(), false);

        let mut tx = session.begin().unwrap();
        tx.merge(champion(1, "Twin").to_row().image()).unwrap();
        tx.merge(champion(2, "Twin").to_row().image()).unwrap();
        tx.commit().unwrap();

        let err = session
            .find_unique(
                ChampionRow::TABLE,
                ChampionRow::COLUMNS,
                "name",
                &Key::Text("Twin".into()),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NonUniqueResult { .. }));
    }

    #[test]
    fn test_scan_page_walks_by_rowid() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let mut session = Session::new(pool.clone(), false);

        let mut tx = session.begin().unwrap();
        for id in 1..=5 {
            tx.merge(champion(id, "x").to_row().image()).unwrap();
        }
        tx.commit().unwrap();

        let first = session
            .scan_page(ChampionRow::TABLE, ChampionRow::COLUMNS, None, 3)
            .unwrap();
        assert_eq!(first.len(), 3);
        let last = first.last().unwrap().0;
        let rest = session
            .scan_page(ChampionRow::TABLE, ChampionRow::COLUMNS, Some(last), 3)
            .unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn test_scan_page_starts_at_minimum_rowid() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let mut session = Session::new(pool.clone(), false);

        let mut tx = session.begin().unwrap();
        tx.merge(champion(i64::MIN, "Aatrox").to_row().image()).unwrap();
        tx.merge(champion(1, "Ahri").to_row().image()).unwrap();
        tx.commit().unwrap();

        let page = session
            .scan_page(ChampionRow::TABLE, ChampionRow::COLUMNS, None, 10)
            .unwrap();
        let rowids: Vec<i64> = page.iter().map(|(rowid, _)| *rowid).collect();
        assert_eq!(rowids, vec![i64::MIN, 1]);
    }

    #[test]
    fn test_connection_is_held_only_while_working() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let mut first = Session::new(pool.clone(), false);
        let mut second = Session::new(pool.clone(), false);
        let mut third = Session::new(pool.clone(), false);
        assert_eq!(in_use(&pool), 0);

        {
            let mut tx = first.begin().unwrap();
            tx.merge(champion(1, "Annie").to_row().image()).unwrap();
            assert_eq!(in_use(&pool), 1);
            tx.commit().unwrap();
        }
        assert_eq!(in_use(&pool), 0);

        // More sessions than pooled connections, all usable in turn.
        assert_eq!(count(&mut first), 1);
        assert_eq!(count(&mut second), 1);
        assert_eq!(count(&mut third), 1);
        assert_eq!(in_use(&pool), 0);

        {
            let mut tx = second.begin().unwrap();
            tx.merge(champion(2, "Brand").to_row().image()).unwrap();
        }
        assert_eq!(in_use(&pool), 0);
        assert_eq!(count(&mut third), 1);
    }

    #[test]
    fn test_closed_session_rejects_work() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let mut session = Session::new(pool.clone(), false);

        session.close();
        assert!(!session.is_open());
        assert!(matches!(session.begin(), Err(StoreError::Closed)));
        assert!(matches!(
            session.scan_all(ChampionRow::TABLE, ChampionRow::COLUMNS),
            Err(StoreError::Closed)
        ));
        assert_eq!(in_use(&pool), 0);
    }

    #[test]
    fn test_upsert_sql_shape() {
        let image = champion(1, "Annie").to_row().image();
        let sql = upsert_sql(&image).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"champion\" (\"id\", \"name\", \"title\") VALUES (?1, ?2, ?3) \
             ON CONFLICT(\"id\") DO UPDATE SET \"name\" = excluded.\"name\", \"title\" = excluded.\"title\""
        );
    }
}
