use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tracing::{debug, info};

use super::{Collection, Storage};
use crate::error::StoreError;
use crate::models::{Record, RecordId};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS definitions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS reports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        definition_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_reports_definition ON reports(definition_id, id);
";

/// SQLite-backed store; `":memory:"` gives a private in-memory database
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA)?;
        info!("Opened definition store at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Raw row as read from either table
type Row = (RecordId, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn into_record((id, name, data): Row) -> Result<Record, StoreError> {
    Ok(Record {
        id,
        name,
        data: serde_json::from_str(&data)?,
    })
}

fn definition_exists(conn: &Connection, id: RecordId) -> Result<bool, StoreError> {
    let found = conn
        .query_row("SELECT 1 FROM definitions WHERE id=?1", params![id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

impl Storage for SqliteStorage {
    fn insert(&self, name: &str, data: &serde_json::Value) -> Result<RecordId, StoreError> {
        let data = serde_json::to_string(data)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO definitions (name, data) VALUES (?1, ?2)",
            params![name, data],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn select(&self, id: RecordId) -> Result<Record, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, data FROM definitions WHERE id=?1",
                params![id],
                read_row,
            )
            .optional()?;
        row.map(into_record).unwrap_or(Err(StoreError::NotFound(id)))
    }

    fn select_all(&self, limit: usize, offset: usize) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, data FROM definitions ORDER BY id LIMIT ?1 OFFSET ?2")?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], read_row)?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_record).collect()
    }

    fn update(&self, id: RecordId, name: &str, data: &serde_json::Value) -> Result<(), StoreError> {
        let data = serde_json::to_string(data)?;
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE definitions SET name=?2, data=?3 WHERE id=?1",
            params![id, name, data],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn delete(&self, id: RecordId) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let affected = tx.execute("DELETE FROM definitions WHERE id=?1", params![id])?;
        if affected == 0 {
            return Err(StoreError::NotFound(id));
        }
        let reports = tx.execute("DELETE FROM reports WHERE definition_id=?1", params![id])?;
        tx.commit()?;
        debug!(id, reports, "Deleted definition");
        Ok(())
    }

    fn purge(&self, collection: Collection) -> Result<(), StoreError> {
        let table = collection.table();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", table), [])?;
        tx.execute("DELETE FROM sqlite_sequence WHERE name=?1", params![table])?;
        if collection == Collection::Definitions {
            // Recycled ids must not inherit reports
            let reports = tx.execute("DELETE FROM reports", [])?;
            debug!(reports, "Dropped reports of purged definitions");
        }
        tx.commit()?;
        info!("Purged {} collection", table);
        Ok(())
    }

    fn healthy(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM definitions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn ids(&self) -> Result<Vec<RecordId>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM definitions ORDER BY id")?;
        let ids = stmt.query_map([], |row| row.get(0))?;
        Ok(ids.collect::<Result<Vec<RecordId>, _>>()?)
    }

    fn insert_report(
        &self,
        definition_id: RecordId,
        name: &str,
        data: &serde_json::Value,
    ) -> Result<RecordId, StoreError> {
        let data = serde_json::to_string(data)?;
        let conn = self.conn.lock();
        if !definition_exists(&conn, definition_id)? {
            return Err(StoreError::NotFound(definition_id));
        }
        conn.execute(
            "INSERT INTO reports (definition_id, name, data, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![definition_id, name, data, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn latest_report(&self, definition_id: RecordId) -> Result<Option<Record>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, data FROM reports WHERE definition_id=?1 ORDER BY id DESC LIMIT 1",
                params![definition_id],
                read_row,
            )
            .optional()?;
        row.map(into_record).transpose()
    }

    fn select_reports(&self, definition_id: RecordId, limit: usize) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, data FROM reports WHERE definition_id=?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![definition_id, limit as i64], read_row)?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    fn store() -> SqliteStorage {
        SqliteStorage::open_in_memory().unwrap()
    }

    #[test]
    fn crud_round_trip() {
        contract::crud_round_trip(&store());
    }

    #[test]
    fn missing_ids_are_not_found() {
        contract::missing_ids_are_not_found(&store());
    }

    #[test]
    fn pagination() {
        contract::pagination(&store());
    }

    #[test]
    fn purge_resets_collection() {
        contract::purge_resets_collection(&store());
    }

    #[test]
    fn purging_definitions_drops_their_reports() {
        contract::purging_definitions_drops_their_reports(&store());
    }

    #[test]
    fn reports_by_definition() {
        contract::reports_by_definition(&store());
    }

    #[test]
    fn reports_for_unknown_definitions_are_rejected() {
        let store = store();
        assert!(matches!(
            store.insert_report(7, "ghost", &serde_json::json!({})),
            Err(StoreError::NotFound(7))
        ));
    }

    #[test]
    fn data_survives_reopening_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arquebus.db");

        let id = {
            let store = SqliteStorage::open(&path).unwrap();
            store.healthy().unwrap();
            store.insert("persisted", &serde_json::json!({"rate": 5})).unwrap()
        };

        let store = SqliteStorage::open(&path).unwrap();
        let record = store.select(id).unwrap();
        assert_eq!(record.name, "persisted");
        assert_eq!(record.data["rate"], 5);
    }
}
