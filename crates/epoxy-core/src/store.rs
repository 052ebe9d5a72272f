//! Durable storage for host records.
//!
//! The store owns all durable state. Saves are full-record overwrites with
//! last-writer-wins semantics; there is no optimistic concurrency and the
//! core never retries. Two implementations are provided: an in-memory store
//! for tests and development, and a SQLite store for single-node
//! deployments.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::host::Host;

/// Errors surfaced by a host store. Callers translate `NotFound` to 404 and
/// everything else to 500; no retry decisions are made here.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists under the requested name.
    #[error("no host record for {name:?}")]
    NotFound {
        /// The name that was looked up.
        name: String,
    },

    /// The backing database or its serialization failed.
    #[error("host store backend: {0}")]
    Backend(String),
}

/// Access to host records. All operations are synchronous and independent.
pub trait HostStore: Send + Sync {
    /// Loads the record stored under `name`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no record exists, [`StoreError::Backend`]
    /// for any storage failure.
    fn load(&self, name: &str) -> Result<Host, StoreError>;

    /// Stores `host` under its name, overwriting any existing record.
    ///
    /// # Errors
    ///
    /// [`StoreError::Backend`] for any storage failure.
    fn save(&self, host: &Host) -> Result<(), StoreError>;

    /// Returns a snapshot of every record. Ordering is unspecified.
    ///
    /// # Errors
    ///
    /// [`StoreError::Backend`] for any storage failure.
    fn list(&self) -> Result<Vec<Host>, StoreError>;
}

/// An in-memory host store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    hosts: Mutex<HashMap<String, Host>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostStore for MemoryStore {
    fn load(&self, name: &str) -> Result<Host, StoreError> {
        let hosts = self
            .hosts
            .lock()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        hosts
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { name: name.to_string() })
    }

    fn save(&self, host: &Host) -> Result<(), StoreError> {
        let mut hosts = self
            .hosts
            .lock()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        hosts.insert(host.name.clone(), host.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Host>, StoreError> {
        let hosts = self
            .hosts
            .lock()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(hosts.values().cloned().collect())
    }
}

/// A SQLite-backed host store. Records are stored as one JSON document per
/// row, keyed by host name, matching the full-record-overwrite contract.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (and if needed initializes) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when the file cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|err| StoreError::Backend(err.to_string()))?;
        Self::with_connection(conn)
    }

    /// Opens a transient in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when SQLite cannot allocate the
    /// database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|err| StoreError::Backend(err.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hosts (
                name   TEXT PRIMARY KEY,
                record TEXT NOT NULL
            )",
        )
        .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl HostStore for SqliteStore {
    fn load(&self, name: &str) -> Result<Host, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let record: Option<String> = conn
            .query_row("SELECT record FROM hosts WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let record = record.ok_or_else(|| StoreError::NotFound { name: name.to_string() })?;
        serde_json::from_str(&record).map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn save(&self, host: &Host) -> Result<(), StoreError> {
        let record =
            serde_json::to_string(host).map_err(|err| StoreError::Backend(err.to_string()))?;
        let conn = self
            .conn
            .lock()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        conn.execute(
            "INSERT INTO hosts (name, record) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET record = excluded.record",
            params![host.name, record],
        )
        .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<Host>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT record FROM hosts")
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut hosts = Vec::new();
        for row in rows {
            let record = row.map_err(|err| StoreError::Backend(err.to_string()))?;
            hosts
                .push(serde_json::from_str(&record).map_err(|err| StoreError::Backend(err.to_string()))?);
        }
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> Host {
        Host { name: name.to_string(), ipv4: "10.0.0.2".to_string(), ..Host::default() }
    }

    fn exercise_store(store: &dyn HostStore) {
        assert!(matches!(store.load("missing"), Err(StoreError::NotFound { .. })));

        store.save(&host("m1.example.org")).unwrap();
        let loaded = store.load("m1.example.org").unwrap();
        assert_eq!(loaded.name, "m1.example.org");
        assert_eq!(loaded.ipv4, "10.0.0.2");

        // Last writer wins on overwrite.
        let mut updated = loaded;
        updated.update_enabled = true;
        store.save(&updated).unwrap();
        assert!(store.load("m1.example.org").unwrap().update_enabled);

        store.save(&host("m2.example.org")).unwrap();
        let mut names: Vec<String> = store.list().unwrap().into_iter().map(|h| h.name).collect();
        names.sort();
        assert_eq!(names, vec!["m1.example.org", "m2.example.org"]);
    }

    #[test]
    fn memory_store_round_trip() {
        exercise_store(&MemoryStore::new());
    }

    #[test]
    fn sqlite_store_round_trip() {
        exercise_store(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save(&host("m1.example.org")).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load("m1.example.org").unwrap().ipv4, "10.0.0.2");
    }
}
