//! SQLite-backed install registry.
//!
//! One row per managed resource recording what was last installed for it.
//! The registry is informational: reconciles never read it to make
//! decisions, so losing it costs nothing but history.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// Errors from install registry operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("install registry sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Last successful install for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRecord {
    /// Resource name.
    pub name: String,
    pub tenant_uuid: String,
    /// Version key, set for URL installs.
    pub latest_version: Option<String>,
    /// Digest key, set for image installs.
    pub image_digest: Option<String>,
    /// RFC 3339 timestamp of the install.
    pub updated_at: String,
}

/// SQLite install registry.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create the registry at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // WAL keeps readers out of the writer's way
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory registry (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agent_clusters (
                name TEXT PRIMARY KEY,
                tenant_uuid TEXT NOT NULL,
                latest_version TEXT,
                image_digest TEXT,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        debug!("install registry schema initialized");
        Ok(())
    }

    /// Insert or update the record for a resource.
    pub fn upsert_install(&self, record: &InstallRecord) -> Result<(), StateStoreError> {
        self.conn.execute(
            r#"
            INSERT INTO agent_clusters (name, tenant_uuid, latest_version, image_digest, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(name) DO UPDATE SET
                tenant_uuid = excluded.tenant_uuid,
                latest_version = excluded.latest_version,
                image_digest = excluded.image_digest,
                updated_at = excluded.updated_at
            "#,
            params![
                record.name,
                record.tenant_uuid,
                record.latest_version,
                record.image_digest,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Fetch the record for a resource.
    pub fn get_install(&self, name: &str) -> Result<Option<InstallRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, tenant_uuid, latest_version, image_digest, updated_at
             FROM agent_clusters WHERE name = ?1",
        )?;

        stmt.query_row(params![name], |row| {
            Ok(InstallRecord {
                name: row.get(0)?,
                tenant_uuid: row.get(1)?,
                latest_version: row.get(2)?,
                image_digest: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })
        .optional()
        .map_err(Into::into)
    }

    /// Drop the record for a resource that no longer exists.
    pub fn delete_install(&self, name: &str) -> Result<(), StateStoreError> {
        self.conn.execute(
            "DELETE FROM agent_clusters WHERE name = ?1",
            params![name],
        )?;
        Ok(())
    }

    /// All records, ordered by resource name.
    pub fn list_installs(&self) -> Result<Vec<InstallRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, tenant_uuid, latest_version, image_digest, updated_at
             FROM agent_clusters ORDER BY name",
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(InstallRecord {
                    name: row.get(0)?,
                    tenant_uuid: row.get(1)?,
                    latest_version: row.get(2)?,
                    image_digest: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }
}
