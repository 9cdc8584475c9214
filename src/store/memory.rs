use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Collection, Storage};
use crate::error::StoreError;
use crate::models::{Record, RecordId};

#[derive(Default)]
struct Table {
    rows: BTreeMap<RecordId, Record>,
    next_id: RecordId,
}

impl Table {
    fn next_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
struct Inner {
    definitions: Table,
    reports: Table,
    /// report id -> definition id
    owners: BTreeMap<RecordId, RecordId>,
}

/// In-memory store with the same contract as [`super::SqliteStorage`]
///
/// Can be switched unavailable to simulate losing the database.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StoreError::Unavailable`] until switched back
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn insert(&self, name: &str, data: &serde_json::Value) -> Result<RecordId, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let id = inner.definitions.next_id();
        inner.definitions.rows.insert(
            id,
            Record {
                id,
                name: name.to_string(),
                data: data.clone(),
            },
        );
        Ok(id)
    }

    fn select(&self, id: RecordId) -> Result<Record, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        inner
            .definitions
            .rows
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn select_all(&self, limit: usize, offset: usize) -> Result<Vec<Record>, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .definitions
            .rows
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn update(&self, id: RecordId, name: &str, data: &serde_json::Value) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let record = inner
            .definitions
            .rows
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        record.name = name.to_string();
        record.data = data.clone();
        Ok(())
    }

    fn delete(&self, id: RecordId) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        if inner.definitions.rows.remove(&id).is_none() {
            return Err(StoreError::NotFound(id));
        }

        let Inner { reports, owners, .. } = &mut *inner;
        owners.retain(|report_id, owner| {
            if *owner == id {
                reports.rows.remove(report_id);
                false
            } else {
                true
            }
        });
        Ok(())
    }

    fn purge(&self, collection: Collection) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        match collection {
            Collection::Definitions => {
                inner.definitions = Table::default();
                inner.reports.rows.clear();
                inner.owners.clear();
            }
            Collection::Reports => {
                inner.reports = Table::default();
                inner.owners.clear();
            }
        }
        Ok(())
    }

    fn healthy(&self) -> Result<(), StoreError> {
        self.check()
    }

    fn count(&self) -> Result<usize, StoreError> {
        self.check()?;
        Ok(self.inner.lock().definitions.rows.len())
    }

    fn ids(&self) -> Result<Vec<RecordId>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().definitions.rows.keys().copied().collect())
    }

    fn insert_report(
        &self,
        definition_id: RecordId,
        name: &str,
        data: &serde_json::Value,
    ) -> Result<RecordId, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        if !inner.definitions.rows.contains_key(&definition_id) {
            return Err(StoreError::NotFound(definition_id));
        }
        let id = inner.reports.next_id();
        inner.reports.rows.insert(
            id,
            Record {
                id,
                name: name.to_string(),
                data: data.clone(),
            },
        );
        inner.owners.insert(id, definition_id);
        Ok(id)
    }

    fn latest_report(&self, definition_id: RecordId) -> Result<Option<Record>, StoreError> {
        Ok(self.select_reports(definition_id, 1)?.into_iter().next())
    }

    fn select_reports(&self, definition_id: RecordId, limit: usize) -> Result<Vec<Record>, StoreError> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .owners
            .iter()
            .rev()
            .filter(|(_, owner)| **owner == definition_id)
            .filter_map(|(report_id, _)| inner.reports.rows.get(report_id).cloned())
            .take(limit)
            .collect())
    }
}
