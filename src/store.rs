//! Persistence (C4 collaborator) — durable storage for instance records
//! across restarts, behind an `InstanceStore` trait so the registry can be
//! exercised against an in-memory fake in tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::instance::{InstanceOptions, InstanceStatus};

/// The persisted shape of one instance: enough to reconstruct an `Instance`
/// on boot without re-running validation (the options were validated when
/// the record was first created).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    pub options: InstanceOptions,
    pub status: InstanceStatus,
    pub port: Option<u16>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub trait InstanceStore: Send + Sync {
    fn save(&self, record: &InstanceRecord) -> Result<()>;
    fn load_all(&self) -> Result<Vec<InstanceRecord>>;
    fn remove(&self, name: &str) -> Result<()>;
}

/// SQLite-backed store. Schema is a single table: options/status are kept
/// as JSON blobs since their shape is owned by `instance.rs`, not by SQL.
pub struct SqliteInstanceStore {
    conn: Mutex<Connection>,
}

impl SqliteInstanceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).context("failed to open instance store")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory instance store")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS instances (
                name TEXT PRIMARY KEY,
                options_json TEXT NOT NULL,
                status TEXT NOT NULL,
                port INTEGER,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

impl InstanceStore for SqliteInstanceStore {
    fn save(&self, record: &InstanceRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let options_json = serde_json::to_string(&record.options)?;
        let status_json = serde_json::to_string(&record.status)?;
        conn.execute(
            "INSERT INTO instances (name, options_json, status, port, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                options_json = excluded.options_json,
                status = excluded.status,
                port = excluded.port",
            params![
                record.name,
                options_json,
                status_json,
                record.port,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<InstanceRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name, options_json, status, port, created_at FROM instances")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<u16>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (name, options_json, status_json, port, created_at) in rows {
            let options: InstanceOptions =
                serde_json::from_str(&options_json).context("corrupt options_json in instance store")?;
            let status: InstanceStatus =
                serde_json::from_str(&status_json).context("corrupt status in instance store")?;
            let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
                .context("corrupt created_at in instance store")?
                .with_timezone(&chrono::Utc);
            records.push(InstanceRecord {
                name,
                options,
                status,
                port,
                created_at,
            });
        }
        Ok(records)
    }

    fn remove(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM instances WHERE name = ?1", params![name])?;
        Ok(())
    }
}

/// In-memory store for tests and for the `--no-persistence` CLI mode.
#[derive(Default)]
pub struct InMemoryInstanceStore {
    records: Mutex<HashMap<String, InstanceRecord>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceStore for InMemoryInstanceStore {
    fn save(&self, record: &InstanceRecord) -> Result<()> {
        self.records.lock().unwrap().insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.records.lock().unwrap().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(name: &str) -> InstanceRecord {
        InstanceRecord {
            name: name.to_string(),
            options: InstanceOptions::default(),
            status: InstanceStatus::Stopped,
            port: Some(8000),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn sqlite_store_round_trips_a_record() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        store.save(&sample_record("llama-a")).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "llama-a");
        assert_eq!(loaded[0].port, Some(8000));
    }

    #[test]
    fn sqlite_store_upserts_on_save() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        store.save(&sample_record("llama-a")).unwrap();
        let mut updated = sample_record("llama-a");
        updated.status = InstanceStatus::Ready;
        store.save(&updated).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, InstanceStatus::Ready);
    }

    #[test]
    fn sqlite_store_remove_deletes_the_record() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        store.save(&sample_record("llama-a")).unwrap();
        store.remove("llama-a").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn in_memory_store_round_trips() {
        let store = InMemoryInstanceStore::new();
        store.save(&sample_record("llama-b")).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
        store.remove("llama-b").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
