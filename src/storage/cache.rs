//! Shared row cache for unique lookups.
//!
//! Entries are keyed by table, lookup column and key. Every committed
//! write to a table invalidates all of that table's entries and bumps
//! its generation; a reader may only install a row fetched under the
//! generation that is still current, so a lookup racing a commit can
//! never reinstall the old row.

use dashmap::DashMap;
use rusqlite::types::Value;
use std::collections::HashMap;

use crate::model::Key;

/// Entries kept per table before the table's cache is emptied.
const TABLE_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct TableCache {
    generation: u64,
    rows: HashMap<(&'static str, Key), Vec<Value>>,
}

/// Process-wide row cache shared by all sessions.
#[derive(Debug, Default)]
pub struct RowCache {
    tables: DashMap<&'static str, TableCache>,
}

impl RowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation of a table. Capture it before querying.
    pub fn generation(&self, table: &'static str) -> u64 {
        self.tables.get(table).map_or(0, |t| t.generation)
    }

    pub fn get(&self, table: &'static str, column: &'static str, key: &Key) -> Option<Vec<Value>> {
        let cache = self.tables.get(table)?;
        cache.rows.get(&(column, key.clone())).cloned()
    }

    /// Install a fetched row, unless the table was written since
    /// `generation` was captured.
    pub fn insert(
        &self,
        table: &'static str,
        column: &'static str,
        key: Key,
        values: Vec<Value>,
        generation: u64,
    ) -> bool {
        let mut cache = self.tables.entry(table).or_default();
        if cache.generation != generation {
            return false;
        }
        if cache.rows.len() >= TABLE_CAPACITY {
            cache.rows.clear();
        }
        cache.rows.insert((column, key), values);
        true
    }

    /// Drop every entry of a table after a committed write.
    pub fn invalidate(&self, table: &'static str) {
        let mut cache = self.tables.entry(table).or_default();
        cache.generation += 1;
        cache.rows.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_get() {
        let cache = RowCache::new();
        let generation = cache.generation("champion");
        assert!(cache.insert("champion", "id", Key::Long(1), vec![Value::Integer(1)], generation));
        assert_eq!(
            cache.get("champion", "id", &Key::Long(1)),
            Some(vec![Value::Integer(1)])
        );
        assert_eq!(cache.get("champion", "name", &Key::Long(1)), None);
    }

    #[test]
    fn test_invalidate_clears_table_only() {
        let cache = RowCache::new();
        cache.insert("a", "id", Key::Long(1), vec![], 0);
        cache.insert("b", "id", Key::Long(1), vec![], 0);

        cache.invalidate("a");
        assert_eq!(cache.get("a", "id", &Key::Long(1)), None);
        assert!(cache.get("b", "id", &Key::Long(1)).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stale_generation_is_rejected() {
        let cache = RowCache::new();
        let seen = cache.generation("champion");
        cache.invalidate("champion");

        assert!(!cache.insert("champion", "id", Key::Long(1), vec![], seen));
        assert!(cache.is_empty());
    }
}
