//! Advisory name → definition index in front of the store
//!
//! Entries are the serialized [`Record`] of a definition, keyed by its name,
//! so two definitions sharing a name overwrite each other. Nothing here is
//! authoritative: every reader must be ready to fall back to the store.

use bytes::Bytes;
use moka::sync::Cache;
use std::time::Duration;

use crate::models::Record;

/// How long an entry lives after being written
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct IndexCache {
    inner: Cache<String, Bytes>,
}

impl IndexCache {
    /// Create a cache holding at most `capacity_bytes` of keys and payloads
    pub fn new(capacity_bytes: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|name: &String, payload: &Bytes| -> u32 {
                u32::try_from(name.len() + payload.len()).unwrap_or(u32::MAX)
            })
            .time_to_live(ttl)
            .build();

        Self { inner }
    }

    /// Index a stored definition under its name
    pub fn put(&self, record: &Record) -> Result<(), serde_json::Error> {
        let payload = serde_json::to_vec(record)?;
        self.insert_payload(&record.name, Bytes::from(payload));
        Ok(())
    }

    /// Store an already serialized payload as-is
    pub fn insert_payload(&self, name: &str, payload: Bytes) {
        self.inner.insert(name.to_string(), payload);
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.inner.get(name)
    }

    /// Look up and decode an entry; `None` on a miss or a payload that no longer decodes
    pub fn record(&self, name: &str) -> Option<Record> {
        let payload = self.get(name)?;
        serde_json::from_slice(&payload).ok()
    }

    pub fn invalidate(&self, name: &str) {
        self.inner.invalidate(name);
    }

    /// Snapshot of every live entry
    pub fn entries(&self) -> Vec<(String, Bytes)> {
        self.inner
            .iter()
            .map(|(name, payload)| (name.to_string(), payload))
            .collect()
    }

    /// Number of live entries
    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: i64, name: &str) -> Record {
        Record {
            id,
            name: name.to_string(),
            data: json!({"name": name, "url": "http://x/", "rate": 1, "duration": "1s"}),
        }
    }

    #[test]
    fn put_then_get_round_trips_the_record() {
        let cache = IndexCache::new(1_000_000, DEFAULT_TTL);
        cache.put(&record(1, "smoke")).unwrap();

        assert_eq!(cache.record("smoke"), Some(record(1, "smoke")));
        assert_eq!(cache.entry_count(), 1);
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn same_name_is_last_write_wins() {
        let cache = IndexCache::new(1_000_000, DEFAULT_TTL);
        cache.put(&record(1, "shared")).unwrap();
        cache.put(&record(2, "shared")).unwrap();

        assert_eq!(cache.record("shared").unwrap().id, 2);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn corrupt_payload_decodes_to_none() {
        let cache = IndexCache::new(1_000_000, DEFAULT_TTL);
        cache.insert_payload("broken", Bytes::from_static(b"{not json"));

        assert!(cache.get("broken").is_some());
        assert!(cache.record("broken").is_none());
    }

    #[test]
    fn invalidate_and_clear_remove_entries() {
        let cache = IndexCache::new(1_000_000, DEFAULT_TTL);
        cache.put(&record(1, "a")).unwrap();
        cache.put(&record(2, "b")).unwrap();

        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert_eq!(cache.entries().len(), 1);

        cache.clear();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = IndexCache::new(1_000_000, Duration::from_millis(50));
        cache.put(&record(1, "short")).unwrap();
        std::thread::sleep(Duration::from_millis(120));

        assert!(cache.get("short").is_none());
    }
}
