//! SQLite persistence for the entity cache and sync queue.
//!
//! Row mapping lives next to each table (`patients`, `queue`). Writers take
//! a plain `&Connection` so [`crate::store::SqliteStore`] can run several of
//! them inside one transaction.

mod patients;
mod queue;
mod schema;

pub(crate) use patients::{delete_patient_record, upsert_patient_record};
pub(crate) use queue::{delete_queue_item, upsert_queue_item};
pub use schema::{SCHEMA, SCHEMA_VERSION};

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Constraint(String),

    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },
}

pub type DbResult<T> = Result<T, DbError>;

/// Connection to the registry database.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the registry database at `path`, creating it if needed.
    ///
    /// File-backed databases use WAL with full sync so a committed batch
    /// survives power loss.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::initialize(conn)
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> DbResult<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> DbResult<Self> {
        let found: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if found > SCHEMA_VERSION {
            return Err(DbError::UnsupportedSchema {
                found,
                supported: SCHEMA_VERSION,
            });
        }

        conn.execute_batch(SCHEMA)?;
        if found < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(Self { conn })
    }

    /// Schema version recorded in the database file.
    pub fn schema_version(&self) -> DbResult<i64> {
        Ok(self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn transaction(&mut self) -> DbResult<rusqlite::Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(db: &Database) -> Vec<String> {
        db.conn()
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_tables_created() {
        let db = Database::open_in_memory().unwrap();
        let tables = table_names(&db);

        assert!(tables.contains(&"entity_cache".to_string()));
        assert!(tables.contains(&"sync_queue".to_string()));
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_file_keeps_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");

        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .unwrap();
        }

        let result = Database::open(&path);
        assert!(matches!(result, Err(DbError::UnsupportedSchema { .. })));
    }
}
