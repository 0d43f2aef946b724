//! In-memory store, used by tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{dequeue_order, LocalStore, StoreError, StoreResult, WriteBatch, WriteOp};
use crate::models::{PatientRecord, SyncQueueItem};

/// Store keeping both tables in process memory.
///
/// Each table has its own lock so one can be read while the other is being
/// written. Batches take both write locks (entities first) for the duration
/// of the apply.
#[derive(Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<String, PatientRecord>>,
    queue: RwLock<HashMap<String, SyncQueueItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get_entity(&self, id: &str) -> StoreResult<Option<PatientRecord>> {
        Ok(self.entities.read()?.get(id).cloned())
    }

    fn get_entity_by_alias(&self, alias: &str) -> StoreResult<Option<PatientRecord>> {
        Ok(self
            .entities
            .read()?
            .values()
            .find(|r| r.temporary_alias.as_deref() == Some(alias))
            .cloned())
    }

    fn list_entities(&self) -> StoreResult<Vec<PatientRecord>> {
        let mut records: Vec<PatientRecord> = self.entities.read()?.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    fn get_queue_item(&self, id: &str) -> StoreResult<Option<SyncQueueItem>> {
        Ok(self.queue.read()?.get(id).cloned())
    }

    fn get_queue_item_for_target(&self, target_id: &str) -> StoreResult<Option<SyncQueueItem>> {
        Ok(self
            .queue
            .read()?
            .values()
            .find(|i| i.target_id == target_id)
            .cloned())
    }

    fn list_queue_items(&self) -> StoreResult<Vec<SyncQueueItem>> {
        let mut items: Vec<SyncQueueItem> = self.queue.read()?.values().cloned().collect();
        items.sort_by(dequeue_order);
        Ok(items)
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut entities = self.entities.write()?;
        let mut queue = self.queue.write()?;

        // Work on copies so a rejected batch leaves nothing behind.
        let mut next_entities = entities.clone();
        let mut next_queue = queue.clone();

        for op in batch.into_ops() {
            match op {
                WriteOp::PutEntity(record) => {
                    if let Some(alias) = &record.temporary_alias {
                        let taken = next_entities
                            .values()
                            .any(|r| r.id != record.id && r.temporary_alias.as_ref() == Some(alias));
                        if taken {
                            return Err(StoreError::DuplicateKey(format!(
                                "temporary alias {alias} already in use"
                            )));
                        }
                    }
                    next_entities.insert(record.id.clone(), record);
                }
                WriteOp::DeleteEntity(id) => {
                    next_entities.remove(&id);
                }
                WriteOp::PutQueueItem(item) => {
                    let taken = next_queue.values().any(|i| {
                        i.id != item.id && i.target_id == item.target_id && i.action == item.action
                    });
                    if taken {
                        return Err(StoreError::DuplicateKey(format!(
                            "queue item for {} already exists",
                            item.target_id
                        )));
                    }
                    next_queue.insert(item.id.clone(), item);
                }
                WriteOp::DeleteQueueItem(id) => {
                    next_queue.remove(&id);
                }
            }
        }

        *entities = next_entities;
        *queue = next_queue;
        Ok(())
    }
}
