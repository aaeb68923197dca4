//! The public object store.
//!
//! [`Store`] translates typed, keyed requests into row lookups on the
//! calling worker's session and routes every write through the
//! [`BatchWriter`]. Build one with [`StoreBuilder`], registering each
//! entity type it will hold.
//!
//! Every operation takes the caller's [`WorkerToken`]. Calls made with
//! one token share one session and are ordered; calls made with
//! different tokens never wait on each other except for database locks.

mod iter;

pub use iter::EntityIter;

use rusqlite::types::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{CacheProvider, Config, SchemaMode, Settings};
use crate::error::StoreError;
use crate::model::{resolve_column, Column, CompletenessMarker, Entity, Key, Row, RowImage, RowValues};
use crate::registry::{SessionRegistry, WorkerToken};
use crate::storage::batch::BatchWriter;
use crate::storage::cache::RowCache;
use crate::storage::pool::SessionFactory;
use crate::storage::schema::TableDef;

/// Collects entity registrations, then validates config and opens the store.
pub struct StoreBuilder {
    config: Config,
    tables: Vec<TableDef>,
}

impl StoreBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            tables: vec![TableDef::of_row::<CompletenessMarker>()],
        }
    }

    /// Register an entity type so its table is managed and it may be stored.
    pub fn register<T: Entity>(mut self) -> Self {
        self.tables.push(TableDef::of_entity::<T>());
        self
    }

    /// Validate the configuration, apply the schema mode and start the
    /// session registry.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, an unreachable database,
    /// conflicting registrations or a schema that does not validate.
    pub fn build(self) -> Result<Store, StoreError> {
        let settings = self.config.validate()?;
        let tables = dedup_tables(self.tables)?;

        let factory = SessionFactory::new(&settings)?;
        factory.apply_schema(settings.schema_mode, &tables)?;

        let registry = Arc::new(SessionRegistry::new(factory, settings.reaper_interval)?);
        let cache = match settings.cache_provider {
            CacheProvider::None => None,
            CacheProvider::Memory => Some(Arc::new(RowCache::new())),
        };
        let writer = BatchWriter::new(Arc::clone(&registry), settings.batch, cache.clone());

        tracing::info!(
            tables = tables.len(),
            cache = ?settings.cache_provider,
            entity_clear_threshold = settings.batch.entity_clear_threshold,
            "Store ready"
        );

        Ok(Store {
            registered: tables.iter().map(|t| t.table).collect(),
            tables,
            settings,
            registry,
            writer,
            cache,
        })
    }
}

/// Keep the first definition of each table; a table registered twice
/// with a different shape is an error.
fn dedup_tables(tables: Vec<TableDef>) -> Result<Vec<TableDef>, StoreError> {
    let mut unique: Vec<TableDef> = Vec::with_capacity(tables.len());
    for def in tables {
        def.check()?;
        match unique.iter().find(|t| t.table == def.table) {
            Some(existing) if *existing == def => {}
            Some(_) => {
                return Err(StoreError::SchemaMismatch(format!(
                    "table {} is registered twice with different definitions",
                    def.table
                )))
            }
            None => unique.push(def),
        }
    }
    Ok(unique)
}

/// Durable, keyed object store.
pub struct Store {
    settings: Settings,
    tables: Vec<TableDef>,
    registered: HashSet<&'static str>,
    registry: Arc<SessionRegistry>,
    writer: BatchWriter,
    cache: Option<Arc<RowCache>>,
}

impl Store {
    pub fn builder(config: Config) -> StoreBuilder {
        StoreBuilder::new(config)
    }

    /// Fetch the object whose indexed column for the key's type equals `key`.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnsupportedKey`] if `T` has no indexed column for
    /// the key's runtime type; a missing row is `Ok(None)`.
    pub fn get<T: Entity>(&self, worker: &WorkerToken, key: &Key) -> Result<Option<T>, StoreError> {
        self.ensure_registered::<T>()?;
        let column = resolve_column::<T>(key)?;
        self.lookup(worker, T::Row::TABLE, T::Row::COLUMNS, column, key)?
            .map(decode::<T>)
            .transpose()
    }

    /// Fetch one result per key, in key order.
    ///
    /// Every key is checked before anything is queried.
    pub fn get_many<T: Entity>(
        &self,
        worker: &WorkerToken,
        keys: &[Key],
    ) -> Result<Vec<Option<T>>, StoreError> {
        self.ensure_registered::<T>()?;
        let columns = keys
            .iter()
            .map(resolve_column::<T>)
            .collect::<Result<Vec<_>, _>>()?;

        keys.iter()
            .zip(columns)
            .map(|(key, column)| {
                self.lookup(worker, T::Row::TABLE, T::Row::COLUMNS, column, key)?
                    .map(decode::<T>)
                    .transpose()
            })
            .collect()
    }

    /// Every stored object of a type, in insertion order.
    pub fn get_all<T: Entity>(&self, worker: &WorkerToken) -> Result<Vec<T>, StoreError> {
        self.ensure_registered::<T>()?;
        let handle = self.registry.acquire(worker)?;
        let rows = handle.lock().scan_all(T::Row::TABLE, T::Row::COLUMNS)?;
        rows.into_iter().map(decode::<T>).collect()
    }

    /// Stream every stored object of a type, one page at a time.
    ///
    /// The iterator holds the worker's session until it is exhausted,
    /// closed or dropped.
    pub fn get_iterator<T: Entity>(&self, worker: &WorkerToken) -> Result<EntityIter<T>, StoreError> {
        self.ensure_registered::<T>()?;
        let handle = self.registry.acquire(worker)?;
        EntityIter::open(worker.clone(), handle, self.settings.fetch_size)
    }

    /// Upsert one object. The key may be absent; objects are stored by
    /// their own identity.
    pub fn store<T: Entity>(
        &self,
        worker: &WorkerToken,
        object: &T,
        _key: Option<&Key>,
    ) -> Result<(), StoreError> {
        self.ensure_registered::<T>()?;
        self.writer.save(worker, object.to_row().image())
    }

    /// Upsert many objects in one transaction.
    ///
    /// With `is_full_set`, the same transaction marks the type complete,
    /// even when `objects` is empty.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidArgument`] if `keys` and `objects` differ in length.
    pub fn store_all<T: Entity>(
        &self,
        worker: &WorkerToken,
        objects: &[T],
        keys: &[Option<Key>],
        is_full_set: bool,
    ) -> Result<(), StoreError> {
        self.ensure_registered::<T>()?;
        if objects.len() != keys.len() {
            return Err(StoreError::InvalidArgument(format!(
                "store_all got {} objects but {} keys",
                objects.len(),
                keys.len()
            )));
        }

        let mut rows: Vec<RowImage> = objects.iter().map(|o| o.to_row().image()).collect();
        if is_full_set {
            rows.push(CompletenessMarker::complete(T::NAME).image());
        }
        self.writer.save_all(worker, rows)?;

        if is_full_set {
            tracing::debug!(entity = T::NAME, count = objects.len(), "Stored full set");
        }
        Ok(())
    }

    /// Delete the object matching `key`. Returns how many rows were
    /// removed; a key with no stored row is not an error.
    pub fn delete<T: Entity>(&self, worker: &WorkerToken, key: &Key) -> Result<usize, StoreError> {
        self.delete_many::<T>(worker, std::slice::from_ref(key))
    }

    /// Delete the objects matching `keys` in one transaction.
    pub fn delete_many<T: Entity>(&self, worker: &WorkerToken, keys: &[Key]) -> Result<usize, StoreError> {
        self.ensure_registered::<T>()?;
        let columns = keys
            .iter()
            .map(resolve_column::<T>)
            .collect::<Result<Vec<_>, _>>()?;

        let mut targets = Vec::with_capacity(keys.len());
        for (key, column) in keys.iter().zip(columns) {
            if let Some(values) = self.lookup(worker, T::Row::TABLE, T::Row::COLUMNS, column, key)? {
                targets.push(RowImage {
                    table: T::Row::TABLE,
                    columns: T::Row::COLUMNS,
                    values,
                });
            }
        }
        self.writer.delete_all(worker, targets)
    }

    /// Whether the whole population of `T` has been stored.
    pub fn has_all<T: Entity>(&self, worker: &WorkerToken) -> Result<bool, StoreError> {
        self.ensure_registered::<T>()?;
        Ok(self
            .marker(worker, T::NAME)?
            .is_some_and(|marker| marker.complete))
    }

    /// Every completeness marker in the store.
    pub fn completeness_markers(&self, worker: &WorkerToken) -> Result<Vec<CompletenessMarker>, StoreError> {
        let handle = self.registry.acquire(worker)?;
        let rows = handle
            .lock()
            .scan_all(CompletenessMarker::TABLE, CompletenessMarker::COLUMNS)?;
        rows.into_iter().map(decode_row::<CompletenessMarker>).collect()
    }

    /// Forget that a type's population is complete. Returns whether a
    /// marker was removed.
    pub fn clear_marker(&self, worker: &WorkerToken, entity_type: &str) -> Result<bool, StoreError> {
        let marker = CompletenessMarker {
            entity_type: entity_type.to_string(),
            complete: false,
        };
        Ok(self.writer.delete(worker, marker.image())? > 0)
    }

    /// Null keys may be passed to [`store`](Self::store) and
    /// [`store_all`](Self::store_all).
    pub fn allows_null_store_keys(&self) -> bool {
        true
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Shut down the session registry. In create-drop mode the managed
    /// tables are dropped once every session is closed.
    ///
    /// Must not race with other calls on this store.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.settings.schema_mode == SchemaMode::CreateDrop {
            self.registry
                .shutdown_with(|factory| factory.drop_schema(&self.tables))
        } else {
            self.registry.shutdown()
        }
    }

    fn ensure_registered<T: Entity>(&self) -> Result<(), StoreError> {
        if self.registered.contains(T::Row::TABLE) {
            Ok(())
        } else {
            Err(StoreError::InvalidArgument(format!(
                "entity type {} is not registered with this store",
                T::NAME
            )))
        }
    }

    fn marker(&self, worker: &WorkerToken, entity_type: &str) -> Result<Option<CompletenessMarker>, StoreError> {
        let key = Key::Text(entity_type.to_string());
        self.lookup(
            worker,
            CompletenessMarker::TABLE,
            CompletenessMarker::COLUMNS,
            "entity_type",
            &key,
        )?
        .map(decode_row::<CompletenessMarker>)
        .transpose()
    }

    /// Unique lookup through the row cache, when one is configured.
    fn lookup(
        &self,
        worker: &WorkerToken,
        table: &'static str,
        columns: &'static [Column],
        column: &'static str,
        key: &Key,
    ) -> Result<Option<Vec<Value>>, StoreError> {
        let generation = match &self.cache {
            Some(cache) => {
                if let Some(values) = cache.get(table, column, key) {
                    return Ok(Some(values));
                }
                Some(cache.generation(table))
            }
            None => None,
        };

        let handle = self.registry.acquire(worker)?;
        let found = handle.lock().find_unique(table, columns, column, key)?;

        if let (Some(cache), Some(generation), Some(values)) = (&self.cache, generation, &found) {
            cache.insert(table, column, key.clone(), values.clone(), generation);
        }
        Ok(found)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Store shutdown failed");
        }
    }
}

fn decode_row<R: Row>(values: Vec<Value>) -> Result<R, StoreError> {
    R::from_values(RowValues::new(R::TABLE, R::COLUMNS, values))
}

/// Rebuild a domain object from fetched column values.
pub(crate) fn decode<T: Entity>(values: Vec<Value>) -> Result<T, StoreError> {
    decode_row::<T::Row>(values).map(T::from_row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::{champion, Champion};
    use crate::model::KeyKind;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Store {
        Store::builder(Config::for_database(dir.path().join("store.db")))
            .register::<Champion>()
            .build()
            .unwrap()
    }

    #[test]
    fn test_get_by_each_key_type() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let worker = WorkerToken::new();

        store.store(&worker, &champion(7, "Zed"), None).unwrap();

        let by_id: Champion = store.get(&worker, &Key::Long(7)).unwrap().unwrap();
        let by_name: Champion = store.get(&worker, &Key::from("Zed")).unwrap().unwrap();
        assert_eq!(by_id, champion(7, "Zed"));
        assert_eq!(by_name, champion(7, "Zed"));
    }

    #[test]
    fn test_unsupported_key_fails_before_querying() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let worker = WorkerToken::new();

        let err = store.get::<Champion>(&worker, &Key::Int(7)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnsupportedKey {
                kind: KeyKind::Int,
                ..
            }
        ));
        assert_eq!(store.registry().live_sessions(), 0);
    }

    #[test]
    fn test_get_many_preserves_key_order() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let worker = WorkerToken::new();

        store
            .store_all(
                &worker,
                &[champion(1, "Ashe"), champion(2, "Bard")],
                &[None, None],
                false,
            )
            .unwrap();

        let found: Vec<Option<Champion>> = store
            .get_many(&worker, &[Key::Long(2), Key::Long(3), Key::from("Ashe")])
            .unwrap();
        assert_eq!(found, vec![Some(champion(2, "Bard")), None, Some(champion(1, "Ashe"))]);
    }

    #[test]
    fn test_store_all_rejects_mismatched_keys() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let worker = WorkerToken::new();

        let err = store
            .store_all(&worker, &[champion(1, "Ashe")], &[], true)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert!(!store.has_all::<Champion>(&worker).unwrap());
    }

    #[test]
    fn test_empty_full_set_still_marks_complete() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let worker = WorkerToken::new();

        store.store_all::<Champion>(&worker, &[], &[], true).unwrap();
        assert!(store.has_all::<Champion>(&worker).unwrap());

        assert!(store.clear_marker(&worker, Champion::NAME).unwrap());
        assert!(!store.has_all::<Champion>(&worker).unwrap());
        assert!(!store.clear_marker(&worker, Champion::NAME).unwrap());
    }

    #[test]
    fn test_unregistered_type_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::builder(Config::for_database(dir.path().join("bare.db")))
            .build()
            .unwrap();
        let worker = WorkerToken::new();

        assert!(matches!(
            store.get::<Champion>(&worker, &Key::Long(1)),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_memory_cache_sees_committed_writes() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::for_database(dir.path().join("cached.db"));
        config.cache_provider = "memory".into();
        let store = Store::builder(config).register::<Champion>().build().unwrap();
        let worker = WorkerToken::new();

        store.store(&worker, &champion(1, "Lux"), None).unwrap();
        let first: Champion = store.get(&worker, &Key::Long(1)).unwrap().unwrap();
        assert_eq!(first.0.name, "Lux");

        store.store(&worker, &champion(1, "Luxanna"), None).unwrap();
        let second: Champion = store.get(&worker, &Key::Long(1)).unwrap().unwrap();
        assert_eq!(second.0.name, "Luxanna");

        assert_eq!(store.delete::<Champion>(&worker, &Key::Long(1)).unwrap(), 1);
        assert!(store.get::<Champion>(&worker, &Key::Long(1)).unwrap().is_none());
    }

    #[test]
    fn test_null_store_keys_allowed() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(store.allows_null_store_keys());
    }
}
