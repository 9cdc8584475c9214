//! Durable storage for test definitions and their run reports
//!
//! [`Storage`] is the one contract both the scheduler and the API talk to.
//! [`SqliteStorage`] is the production adapter, [`MemoryStorage`] implements
//! the same contract in memory for tests.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;
use crate::models::{Record, RecordId};

/// The collections a store holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Definitions,
    Reports,
}

impl Collection {
    pub fn table(&self) -> &'static str {
        match self {
            Collection::Definitions => "definitions",
            Collection::Reports => "reports",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for Collection {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "definitions" => Ok(Collection::Definitions),
            "reports" => Ok(Collection::Reports),
            other => Err(StoreError::UnknownCollection(other.to_string())),
        }
    }
}

/// Capability set of a definition store
///
/// Single operations are atomic; nothing spans more than one call.
pub trait Storage: Send + Sync {
    /// Store a new definition and return its assigned id
    fn insert(&self, name: &str, data: &serde_json::Value) -> Result<RecordId, StoreError>;

    fn select(&self, id: RecordId) -> Result<Record, StoreError>;

    /// Page through definitions in id order. No rows is an empty page, not an error.
    fn select_all(&self, limit: usize, offset: usize) -> Result<Vec<Record>, StoreError>;

    fn update(&self, id: RecordId, name: &str, data: &serde_json::Value) -> Result<(), StoreError>;

    /// Remove a definition together with its reports
    fn delete(&self, id: RecordId) -> Result<(), StoreError>;

    /// Clear a collection and restart its id sequence. Test and ops use only.
    ///
    /// Purging definitions also drops every report, since their owners are gone.
    fn purge(&self, collection: Collection) -> Result<(), StoreError>;

    /// Lightweight connectivity probe
    fn healthy(&self) -> Result<(), StoreError>;

    /// Number of stored definitions
    fn count(&self) -> Result<usize, StoreError>;

    /// Ids of every stored definition, ascending
    fn ids(&self) -> Result<Vec<RecordId>, StoreError>;

    fn insert_report(
        &self,
        definition_id: RecordId,
        name: &str,
        data: &serde_json::Value,
    ) -> Result<RecordId, StoreError>;

    /// Most recently persisted report for a definition, if any
    fn latest_report(&self, definition_id: RecordId) -> Result<Option<Record>, StoreError>;

    /// Reports for a definition, newest first
    fn select_reports(&self, definition_id: RecordId, limit: usize) -> Result<Vec<Record>, StoreError>;
}

/// Read every definition, one page at a time
pub fn select_every(store: &dyn Storage, page_size: usize) -> Result<Vec<Record>, StoreError> {
    let page_size = page_size.max(1);
    let mut records = Vec::new();
    loop {
        let page = store.select_all(page_size, records.len())?;
        let done = page.len() < page_size;
        records.extend(page);
        if done {
            return Ok(records);
        }
    }
}
