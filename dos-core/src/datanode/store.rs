use crate::error::{DosError, Result};
use crate::protocol::ObjectPayload;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durable per-node object table. Writes return the object's local revision,
/// which starts at 1 and grows by one per mutation.
pub trait LocalStore: Send + Sync {
    /// Insert `name`, or bump the revision of an existing copy.
    fn write(&self, name: &str, data: &[u8]) -> Result<i64>;

    /// Fails with [`DosError::ObjectNotInStore`] if absent.
    fn update(&self, name: &str, data: &[u8]) -> Result<i64>;

    /// Returns the revision the object had when it was removed. Fails with
    /// [`DosError::ObjectNotInStore`] if absent.
    fn delete(&self, name: &str) -> Result<i64>;

    fn get(&self, name: &str) -> Result<Option<StoredObject>>;

    /// The requested objects this node holds, in request order.
    fn read_many(&self, names: &[String]) -> Result<Vec<ObjectPayload>>;

    fn list_objects(&self) -> Result<Vec<String>>;

    fn size(&self) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub name: String,
    pub data: Vec<u8>,
    pub revision: i64,
    pub updated_at: String,
}

pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS datanode (
                object TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                sequence INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }
}

impl LocalStore for SqliteStore {
    fn write(&self, name: &str, data: &[u8]) -> Result<i64> {
        let conn = self.get_conn()?;
        let revision = conn.query_row(
            "INSERT INTO datanode (object, data, sequence, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(object) DO UPDATE SET
                data = excluded.data,
                sequence = datanode.sequence + 1,
                updated_at = excluded.updated_at
             RETURNING sequence",
            params![name, data, Utc::now().to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(revision)
    }

    fn update(&self, name: &str, data: &[u8]) -> Result<i64> {
        let conn = self.get_conn()?;
        let revision: Option<i64> = conn
            .query_row(
                "UPDATE datanode SET data = ?2, sequence = sequence + 1, updated_at = ?3
                 WHERE object = ?1
                 RETURNING sequence",
                params![name, data, Utc::now().to_rfc3339()],
                |row| row.get(0),
            )
            .optional()?;
        revision.ok_or_else(|| DosError::ObjectNotInStore(name.to_string()))
    }

    fn delete(&self, name: &str) -> Result<i64> {
        let conn = self.get_conn()?;
        let revision: Option<i64> = conn
            .query_row(
                "DELETE FROM datanode WHERE object = ?1 RETURNING sequence",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        revision.ok_or_else(|| DosError::ObjectNotInStore(name.to_string()))
    }

    fn get(&self, name: &str) -> Result<Option<StoredObject>> {
        let conn = self.get_conn()?;
        let object = conn
            .query_row(
                "SELECT object, data, sequence, updated_at FROM datanode WHERE object = ?1",
                params![name],
                |row| {
                    Ok(StoredObject {
                        name: row.get(0)?,
                        data: row.get(1)?,
                        revision: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(object)
    }

    fn read_many(&self, names: &[String]) -> Result<Vec<ObjectPayload>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT data FROM datanode WHERE object = ?1")?;

        let mut found = Vec::new();
        for name in names {
            let data: Option<Vec<u8>> = stmt
                .query_row(params![name], |row| row.get(0))
                .optional()?;
            if let Some(data) = data {
                found.push(ObjectPayload::new(name.clone(), data));
            }
        }
        Ok(found)
    }

    fn list_objects(&self) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT object FROM datanode ORDER BY object")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    fn size(&self) -> Result<u64> {
        let conn = self.get_conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok((page_count.max(0) as u64) * (page_size.max(0) as u64))
    }
}
