//! Transactional batch writes.
//!
//! Every batch runs in one transaction on the calling worker's session:
//! - Saves are merged by identity and flushed as upserts
//! - When the session manages `entity_clear_threshold` rows it is
//!   flushed and cleared, bounding memory without committing early
//! - Deletes remove rows by identity
//! - Any failure rolls the whole batch back before the error is returned

use std::collections::BTreeSet;
use std::sync::Arc;

use super::cache::RowCache;
use super::session::SessionTx;
use crate::error::StoreError;
use crate::model::RowImage;
use crate::registry::{SessionRegistry, WorkerToken};

/// Configuration for batch writes.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Managed row count at which a session is flushed and cleared
    pub entity_clear_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            entity_clear_threshold: 100,
        }
    }
}

impl BatchConfig {
    /// Create a BatchConfig from application config values.
    pub fn from_config(entity_clear_threshold: usize) -> Self {
        Self {
            entity_clear_threshold,
        }
    }
}

/// Writes batches of rows through the session registry.
pub struct BatchWriter {
    registry: Arc<SessionRegistry>,
    config: BatchConfig,
    cache: Option<Arc<RowCache>>,
}

impl BatchWriter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        config: BatchConfig,
        cache: Option<Arc<RowCache>>,
    ) -> Self {
        Self {
            registry,
            config,
            cache,
        }
    }

    /// Upsert one row.
    pub fn save(&self, worker: &WorkerToken, row: RowImage) -> Result<(), StoreError> {
        self.save_all(worker, vec![row])
    }

    /// Upsert every row in one transaction.
    pub fn save_all(&self, worker: &WorkerToken, rows: Vec<RowImage>) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let tables = touched_tables(&rows);
        let count = rows.len();
        let threshold = self.config.entity_clear_threshold;

        let handle = self.registry.acquire(worker)?;
        let mut session = handle.lock();
        let session_id = session.id();
        let mut tx = session.begin()?;

        match merge_all(&mut tx, rows, threshold) {
            Ok(clears) => {
                tx.commit()?;
                tracing::debug!(session = %session_id, rows = count, clears, "Committed save batch");
            }
            Err(e) => {
                rollback(tx, &e);
                return Err(e);
            }
        }
        drop(session);

        self.invalidate(&tables);
        Ok(())
    }

    /// Delete one row by identity. Returns the number of rows removed.
    pub fn delete(&self, worker: &WorkerToken, row: RowImage) -> Result<usize, StoreError> {
        self.delete_all(worker, vec![row])
    }

    /// Delete every row by identity in one transaction.
    pub fn delete_all(&self, worker: &WorkerToken, rows: Vec<RowImage>) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let tables = touched_tables(&rows);

        let handle = self.registry.acquire(worker)?;
        let mut session = handle.lock();
        let session_id = session.id();
        let mut tx = session.begin()?;

        let mut removed = 0;
        for row in &rows {
            match tx.delete(row) {
                Ok(n) => removed += n,
                Err(e) => {
                    rollback(tx, &e);
                    return Err(e);
                }
            }
        }
        tx.commit()?;
        drop(session);

        tracing::debug!(session = %session_id, rows = rows.len(), removed, "Committed delete batch");
        self.invalidate(&tables);
        Ok(removed)
    }

    fn invalidate(&self, tables: &BTreeSet<&'static str>) {
        if let Some(cache) = &self.cache {
            for table in tables {
                cache.invalidate(table);
            }
        }
    }
}

/// Merge rows, flushing and clearing the session whenever it manages
/// `threshold` rows. Returns how many times it was cleared.
fn merge_all(tx: &mut SessionTx<'_>, rows: Vec<RowImage>, threshold: usize) -> Result<usize, StoreError> {
    let mut clears = 0;
    for row in rows {
        tx.merge(row)?;
        if tx.entity_count() >= threshold {
            tx.flush()?;
            tx.clear();
            clears += 1;
        }
    }
    Ok(clears)
}

fn rollback(tx: SessionTx<'_>, cause: &StoreError) {
    if let Err(e) = tx.rollback() {
        tracing::warn!(error = %e, cause = %cause, "Rollback failed");
    } else {
        tracing::debug!(cause = %cause, "Rolled back batch");
    }
}

fn touched_tables(rows: &[RowImage]) -> BTreeSet<&'static str> {
    rows.iter().map(|r| r.table).collect()
}
