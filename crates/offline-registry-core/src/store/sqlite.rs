//! SQLite-backed store.

use std::path::Path;
use std::sync::Mutex;

use super::{LocalStore, StoreResult, WriteBatch, WriteOp};
use crate::db::{self, Database};
use crate::models::{PatientRecord, SyncQueueItem};

/// Durable store over a single SQLite connection.
///
/// Batches run inside one SQLite transaction.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }
}

impl LocalStore for SqliteStore {
    fn get_entity(&self, id: &str) -> StoreResult<Option<PatientRecord>> {
        Ok(self.db.lock()?.get_patient_record(id)?)
    }

    fn get_entity_by_alias(&self, alias: &str) -> StoreResult<Option<PatientRecord>> {
        Ok(self.db.lock()?.get_patient_record_by_alias(alias)?)
    }

    fn list_entities(&self) -> StoreResult<Vec<PatientRecord>> {
        Ok(self.db.lock()?.list_patient_records()?)
    }

    fn get_queue_item(&self, id: &str) -> StoreResult<Option<SyncQueueItem>> {
        Ok(self.db.lock()?.get_queue_item(id)?)
    }

    fn get_queue_item_for_target(&self, target_id: &str) -> StoreResult<Option<SyncQueueItem>> {
        Ok(self.db.lock()?.get_queue_item_for_target(target_id)?)
    }

    fn list_queue_items(&self) -> StoreResult<Vec<SyncQueueItem>> {
        Ok(self.db.lock()?.list_queue_items()?)
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut guard = self.db.lock()?;
        let tx = guard.transaction()?;
        for op in batch.into_ops() {
            match op {
                WriteOp::PutEntity(record) => db::upsert_patient_record(&tx, &record)?,
                WriteOp::DeleteEntity(id) => {
                    db::delete_patient_record(&tx, &id)?;
                }
                WriteOp::PutQueueItem(item) => db::upsert_queue_item(&tx, &item)?,
                WriteOp::DeleteQueueItem(id) => {
                    db::delete_queue_item(&tx, &id)?;
                }
            }
        }
        tx.commit().map_err(db::DbError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Actor, ActorRole, PatientFields, SyncStatus};

    fn pending(id: &str) -> (PatientRecord, SyncQueueItem) {
        let fields = PatientFields::new("Asha Devi", "9876543210", "PHC-1");
        let actor = Actor::new("w-1", ActorRole::Phc);
        (
            PatientRecord::new_pending(id.into(), fields.clone(), actor.clone(), 3),
            SyncQueueItem::create_entity(id.into(), fields, 1, 3, actor),
        )
    }

    #[test]
    fn test_batch_commits_both_tables() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (record, item) = pending("TEMP_1_PHC");

        store
            .apply(WriteBatch::new().put_entity(record).put_queue_item(item.clone()))
            .unwrap();

        assert!(store.get_entity("TEMP_1_PHC").unwrap().is_some());
        assert_eq!(store.get_queue_item(&item.id).unwrap().unwrap().target_id, "TEMP_1_PHC");
        assert_eq!(store.list_unsynced().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (record, item) = pending("TEMP_1_PHC");
        store
            .apply(WriteBatch::new().put_entity(record).put_queue_item(item))
            .unwrap();

        // Second item for the same target violates the unique index; the
        // entity written earlier in the batch must not survive.
        let (record2, mut item2) = pending("TEMP_2_PHC");
        item2.target_id = "TEMP_1_PHC".into();
        let result = store.apply(WriteBatch::new().put_entity(record2).put_queue_item(item2));

        assert!(result.is_err());
        assert!(store.get_entity("TEMP_2_PHC").unwrap().is_none());
        assert_eq!(store.list_queue_items().unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_entity_by_alias() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (mut record, _) = pending("P-1");
        record.temporary_alias = Some("TEMP_1_PHC".into());
        record.status = SyncStatus::Synced;
        store.apply(WriteBatch::new().put_entity(record)).unwrap();

        assert_eq!(store.resolve_entity("TEMP_1_PHC").unwrap().unwrap().id, "P-1");
        assert_eq!(store.resolve_entity("P-1").unwrap().unwrap().id, "P-1");
        assert!(store.list_unsynced().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let (record, item) = pending("TEMP_1_PHC");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .apply(WriteBatch::new().put_entity(record.clone()).put_queue_item(item))
                .unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get_entity("TEMP_1_PHC").unwrap().unwrap(), record);
        assert_eq!(reopened.list_queue_items().unwrap().len(), 1);
    }
}
