//! SQLite-backed local store
//!
//! One table per collection, each row a JSON document keyed by id. A store
//! opened without a backing database ("detached") answers every call with an
//! empty result instead of failing, for hosts that have no client runtime.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::entity::{record_id, EntityType};
use crate::error::StoreError;

use super::meta;
use super::migrate::Migrator;

/// Collection holding queued mutations
pub const PENDING_OPERATIONS: &str = "pendingOperations";

/// Collection holding engine metadata
pub const META: &str = "meta";

/// File name of the store inside the data directory
pub const DB_FILE: &str = "local-store.db";

pub struct LocalStore {
    conn: Option<Mutex<Connection>>,
}

impl LocalStore {
    /// Open (or create) the store in `data_dir` and migrate it to the current schema.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;

        // Enable WAL mode for concurrent read access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self::from_connection(conn, &Migrator::new())?;
        info!(path = %db_path.display(), "Local store opened");
        Ok(store)
    }

    /// In-memory store, migrated to the current schema.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, &Migrator::new())
    }

    /// Store with no backing database. All reads are empty and writes are dropped.
    pub fn detached() -> Self {
        Self { conn: None }
    }

    /// Wrap an existing connection, creating the base layout and running `migrator`.
    ///
    /// The connection is not shared until migration finishes, so nothing can
    /// write to the store while it is being upgraded.
    pub fn from_connection(mut conn: Connection, migrator: &Migrator) -> Result<Self, StoreError> {
        create_base_layout(&conn)?;
        migrator.run(&mut conn)?;
        Ok(Self {
            conn: Some(Mutex::new(conn)),
        })
    }

    pub fn is_attached(&self) -> bool {
        self.conn.is_some()
    }

    fn lock(&self) -> Result<Option<MutexGuard<'_, Connection>>, StoreError> {
        match &self.conn {
            Some(conn) => conn.lock().map(Some).map_err(|_| StoreError::Poisoned),
            None => Ok(None),
        }
    }

    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        match self.lock()? {
            Some(conn) => get(&conn, collection, id),
            None => Ok(None),
        }
    }

    pub fn get_all(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        match self.lock()? {
            Some(conn) => get_all(&conn, collection),
            None => Ok(Vec::new()),
        }
    }

    /// Upsert a record keyed by its `id` field.
    pub fn put(&self, collection: &str, record: &Value) -> Result<(), StoreError> {
        match self.lock()? {
            Some(conn) => put(&conn, collection, record),
            None => Ok(()),
        }
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        match self.lock()? {
            Some(conn) => delete(&conn, collection, id),
            None => Ok(()),
        }
    }

    /// Replace a collection's contents and stamp its last-sync time.
    pub fn replace_all(
        &self,
        collection: &str,
        records: &[Value],
        synced_at: i64,
    ) -> Result<(), StoreError> {
        self.atomically(|txn| txn.replace_all(collection, records, synced_at))
    }

    pub fn get_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.lock()? {
            Some(conn) => get_meta(&conn, key),
            None => Ok(None),
        }
    }

    pub fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        match self.lock()? {
            Some(conn) => put_meta(&conn, key, value),
            None => Ok(()),
        }
    }

    /// Run `f` inside one SQLite transaction. Detached stores return `T::default()`.
    pub fn atomically<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Default,
        F: FnOnce(&StoreTxn<'_>) -> Result<T, StoreError>,
    {
        let mut guard = match self.lock()? {
            Some(guard) => guard,
            None => return Ok(T::default()),
        };
        let tx = guard.transaction()?;
        let out = f(&StoreTxn { conn: &*tx })?;
        tx.commit()?;
        Ok(out)
    }
}

/// Store operations bound to an open transaction.
pub struct StoreTxn<'a> {
    conn: &'a Connection,
}

impl<'a> StoreTxn<'a> {
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        get(self.conn, collection, id)
    }

    pub fn get_all(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        get_all(self.conn, collection)
    }

    pub fn put(&self, collection: &str, record: &Value) -> Result<(), StoreError> {
        put(self.conn, collection, record)
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        delete(self.conn, collection, id)
    }

    pub fn get_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        get_meta(self.conn, key)
    }

    pub fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        put_meta(self.conn, key, value)
    }

    pub fn replace_all(
        &self,
        collection: &str,
        records: &[Value],
        synced_at: i64,
    ) -> Result<(), StoreError> {
        let table = table_name(collection)?;
        self.conn.execute(&format!("DELETE FROM {table}"), [])?;
        for record in records {
            put(self.conn, collection, record)?;
        }
        if let Some(entity) = EntityType::from_collection(collection) {
            put_meta(self.conn, entity.descriptor().sync_key, &synced_at)?;
        }
        debug!(collection, count = records.len(), "Replaced collection");
        Ok(())
    }
}

/// Tables present at schema version 1.
pub(crate) const BASE_COLLECTIONS: [&str; 7] = [
    "categories",
    "subcategories",
    "dishes",
    "variants",
    "tables",
    PENDING_OPERATIONS,
    META,
];

fn create_base_layout(conn: &Connection) -> Result<(), StoreError> {
    for collection in BASE_COLLECTIONS {
        create_collection(conn, collection)?;
    }
    Ok(())
}

pub(crate) fn create_collection(conn: &Connection, collection: &str) -> Result<(), StoreError> {
    let table = table_name(collection)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL
        );"
    ))?;
    Ok(())
}

/// Quote a collection name for SQL after checking it is a plain identifier.
fn table_name(collection: &str) -> Result<String, StoreError> {
    let valid = !collection.is_empty()
        && collection.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !collection.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(format!("\"{collection}\""))
    } else {
        Err(StoreError::InvalidCollection(collection.to_string()))
    }
}

pub(crate) fn get(conn: &Connection, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
    let table = table_name(collection)?;
    let mut stmt = conn.prepare_cached(&format!("SELECT data FROM {table} WHERE id = ?1"))?;
    let data: Option<String> = stmt.query_row([id], |row| row.get(0)).optional()?;
    match data {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

pub(crate) fn get_all(conn: &Connection, collection: &str) -> Result<Vec<Value>, StoreError> {
    let table = table_name(collection)?;
    let mut stmt = conn.prepare_cached(&format!("SELECT data FROM {table} ORDER BY rowid"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut records = Vec::new();
    for data in rows {
        records.push(serde_json::from_str(&data?)?);
    }
    Ok(records)
}

pub(crate) fn put(conn: &Connection, collection: &str, record: &Value) -> Result<(), StoreError> {
    let id = record_id(record).ok_or_else(|| StoreError::MissingId {
        collection: collection.to_string(),
    })?;
    put_raw(conn, collection, id, &serde_json::to_string(record)?)
}

fn put_raw(conn: &Connection, collection: &str, id: &str, data: &str) -> Result<(), StoreError> {
    let table = table_name(collection)?;
    conn.execute(
        &format!(
            "INSERT INTO {table} (id, data) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET data = ?2"
        ),
        params![id, data],
    )?;
    Ok(())
}

pub(crate) fn delete(conn: &Connection, collection: &str, id: &str) -> Result<(), StoreError> {
    let table = table_name(collection)?;
    conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), [id])?;
    Ok(())
}

pub(crate) fn get_meta<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>, StoreError> {
    match get_meta_raw(conn, key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

fn get_meta_raw(conn: &Connection, key: &str) -> Result<Option<Value>, StoreError> {
    let mut stmt = conn.prepare_cached(&format!("SELECT data FROM \"{META}\" WHERE id = ?1"))?;
    let data: Option<String> = stmt.query_row([key], |row| row.get(0)).optional()?;
    match data {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

pub(crate) fn put_meta<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<(), StoreError> {
    put_raw(conn, META, key, &serde_json::to_string(value)?)?;
    debug!(key, "Stored meta");
    Ok(())
}

/// Whether a collection table exists.
pub(crate) fn collection_exists(conn: &Connection, collection: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [collection],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

impl LocalStore {
    /// Names of all collections currently present.
    pub fn collections(&self) -> Result<Vec<String>, StoreError> {
        let conn = match self.lock()? {
            Some(conn) => conn,
            None => return Ok(Vec::new()),
        };
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Stored schema version (1 when never recorded).
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(self
            .get_meta::<meta::SchemaVersion>(meta::SCHEMA_VERSION)?
            .map(|v| v.version)
            .unwrap_or(1))
    }

    /// Last successful refresh time for an entity collection.
    pub fn last_sync(&self, entity: EntityType) -> Result<Option<i64>, StoreError> {
        self.get_meta(entity.descriptor().sync_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_delete() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .put("dishes", &json!({"id": "d1", "name": "Dal Makhani"}))
            .unwrap();

        let dish = store.get("dishes", "d1").unwrap().unwrap();
        assert_eq!(dish["name"], "Dal Makhani");

        store
            .put("dishes", &json!({"id": "d1", "name": "Dal Tadka"}))
            .unwrap();
        assert_eq!(store.get_all("dishes").unwrap().len(), 1);
        assert_eq!(store.get("dishes", "d1").unwrap().unwrap()["name"], "Dal Tadka");

        store.delete("dishes", "d1").unwrap();
        assert!(store.get("dishes", "d1").unwrap().is_none());
    }

    #[test]
    fn test_put_without_id_fails() {
        let store = LocalStore::open_in_memory().unwrap();
        let err = store.put("dishes", &json!({"name": "nameless"})).unwrap_err();
        assert!(matches!(err, StoreError::MissingId { .. }));
    }

    #[test]
    fn test_invalid_collection_rejected() {
        let store = LocalStore::open_in_memory().unwrap();
        let err = store.get_all("dishes; DROP TABLE meta").unwrap_err();
        assert!(matches!(err, StoreError::InvalidCollection(_)));
    }

    #[test]
    fn test_replace_all_stamps_last_sync() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put("categories", &json!({"id": "old"})).unwrap();

        store
            .replace_all(
                "categories",
                &[json!({"id": "c1", "name": "Starters"}), json!({"id": "c2", "name": "Mains"})],
                1_234,
            )
            .unwrap();

        let all = store.get_all("categories").unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.get("categories", "old").unwrap().is_none());
        assert_eq!(store.last_sync(EntityType::Category).unwrap(), Some(1_234));
    }

    #[test]
    fn test_atomically_rolls_back_on_error() {
        let store = LocalStore::open_in_memory().unwrap();
        let result: Result<(), StoreError> = store.atomically(|txn| {
            txn.put("tables", &json!({"id": "t1", "number": 1}))?;
            txn.put("tables", &json!({"number": 2}))?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(store.get("tables", "t1").unwrap().is_none());
    }

    #[test]
    fn test_detached_store_is_inert() {
        let store = LocalStore::detached();
        assert!(!store.is_attached());
        store.put("dishes", &json!({"id": "d1"})).unwrap();
        assert!(store.get("dishes", "d1").unwrap().is_none());
        assert!(store.get_all("dishes").unwrap().is_empty());
        store.delete("dishes", "d1").unwrap();
        store.replace_all("dishes", &[json!({"id": "d2"})], 1).unwrap();
        assert!(store.get_meta::<i64>("anything").unwrap().is_none());
        let n: usize = store.atomically(|_| Ok(5)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_open_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = LocalStore::open(dir.path()).unwrap();
            store.put("variants", &json!({"id": "v1", "name": "Half"})).unwrap();
        }
        let store = LocalStore::open(dir.path()).unwrap();
        assert_eq!(store.get("variants", "v1").unwrap().unwrap()["name"], "Half");
        assert_eq!(store.schema_version().unwrap(), super::super::migrate::TARGET_VERSION);
    }
}
