use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::IndexCache;
use crate::error::StoreError;
use crate::models::{Record, RecordId, TestDefinition};
use crate::store::Storage;

/// Default page size of [`Definitions::list`]
pub const DEFAULT_PAGE_SIZE: i64 = 10;
/// Largest page [`Definitions::list`] returns
pub const MAX_PAGE_SIZE: i64 = 100;

/// Write path for test definitions
///
/// Every change lands in the store first, then the index cache is brought in
/// line. Cache failures are logged and never fail the operation.
#[derive(Clone)]
pub struct Definitions {
    store: Arc<dyn Storage>,
    cache: IndexCache,
}

impl Definitions {
    pub fn new(store: Arc<dyn Storage>, cache: IndexCache) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub fn cache(&self) -> &IndexCache {
        &self.cache
    }

    pub fn create(&self, definition: &TestDefinition) -> Result<Record, StoreError> {
        let data = serde_json::to_value(definition)?;
        let id = self.store.insert(&definition.name, &data)?;
        let record = Record {
            id,
            name: definition.name.clone(),
            data,
        };
        self.index(&record);
        info!(id, name = %record.name, "Created definition");
        Ok(record)
    }

    pub fn update(&self, id: RecordId, definition: &TestDefinition) -> Result<Record, StoreError> {
        let previous = self.store.select(id)?;
        let data = serde_json::to_value(definition)?;
        self.store.update(id, &definition.name, &data)?;

        if previous.name != definition.name {
            self.unindex(&previous);
        }
        let record = Record {
            id,
            name: definition.name.clone(),
            data,
        };
        self.index(&record);
        info!(id, name = %record.name, "Updated definition");
        Ok(record)
    }

    pub fn delete(&self, id: RecordId) -> Result<(), StoreError> {
        let record = self.store.select(id)?;
        self.store.delete(id)?;
        self.unindex(&record);
        info!(id, name = %record.name, "Deleted definition");
        Ok(())
    }

    pub fn get(&self, id: RecordId) -> Result<Record, StoreError> {
        self.store.select(id)
    }

    /// One page of definitions in id order
    ///
    /// `count` is clamped to `1..=100` (default 10); a negative `start` reads
    /// from the beginning.
    pub fn list(&self, count: Option<i64>, start: Option<i64>) -> Result<Vec<Record>, StoreError> {
        let count = count.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let start = start.unwrap_or(0).max(0);
        self.store.select_all(count as usize, start as usize)
    }

    /// Latest persisted report of an existing definition
    pub fn latest_report(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
        self.store.select(id)?;
        self.store.latest_report(id)
    }

    fn index(&self, record: &Record) {
        if let Err(e) = self.cache.put(record) {
            warn!(id = record.id, "Failed to index definition: {}", e);
        }
    }

    /// Drop the cache entry for `record`, unless the name now points at another definition
    fn unindex(&self, record: &Record) {
        match self.cache.record(&record.name) {
            Some(cached) if cached.id != record.id => {
                debug!(id = record.id, other = cached.id, "Cache entry belongs to another definition");
            }
            _ => self.cache.invalidate(&record.name),
        }
    }
}
