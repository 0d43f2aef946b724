//! Local durable store abstraction.
//!
//! Two logical tables keyed by id:
//!
//! - **Entity Cache**: [`PatientRecord`]s keyed by current id (temporary or
//!   permanent).
//! - **Sync Queue**: [`SyncQueueItem`]s keyed by queue item id.
//!
//! Reads are independent per table. Writes go through [`WriteBatch`], which a
//! backend must apply atomically: either every operation lands or none does.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use thiserror::Error;

use crate::models::{PatientRecord, SyncQueueItem, SyncStatus};

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] crate::db::DbError),

    #[error("Store lock poisoned: {0}")]
    Poisoned(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        StoreError::Poisoned(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A single write inside a batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    PutEntity(PatientRecord),
    DeleteEntity(String),
    PutQueueItem(SyncQueueItem),
    DeleteQueueItem(String),
}

/// An ordered set of writes applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_entity(mut self, record: PatientRecord) -> Self {
        self.ops.push(WriteOp::PutEntity(record));
        self
    }

    pub fn delete_entity(mut self, id: impl Into<String>) -> Self {
        self.ops.push(WriteOp::DeleteEntity(id.into()));
        self
    }

    pub fn put_queue_item(mut self, item: SyncQueueItem) -> Self {
        self.ops.push(WriteOp::PutQueueItem(item));
        self
    }

    pub fn delete_queue_item(mut self, id: impl Into<String>) -> Self {
        self.ops.push(WriteOp::DeleteQueueItem(id.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Crash-surviving key-value store holding the entity cache and sync queue.
pub trait LocalStore: Send + Sync {
    /// Get a cached record by current id.
    fn get_entity(&self, id: &str) -> StoreResult<Option<PatientRecord>>;

    /// Get a reconciled record by its former temporary id.
    fn get_entity_by_alias(&self, alias: &str) -> StoreResult<Option<PatientRecord>>;

    /// All cached records, oldest first.
    fn list_entities(&self) -> StoreResult<Vec<PatientRecord>>;

    /// Get a queue item by id.
    fn get_queue_item(&self, id: &str) -> StoreResult<Option<SyncQueueItem>>;

    /// Get the queue item targeting a temporary id.
    fn get_queue_item_for_target(&self, target_id: &str) -> StoreResult<Option<SyncQueueItem>>;

    /// All queue items in dequeue order (priority, then sequence).
    fn list_queue_items(&self) -> StoreResult<Vec<SyncQueueItem>>;

    /// Apply a batch atomically.
    fn apply(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Look a record up by current id, falling back to its temporary alias.
    fn resolve_entity(&self, id: &str) -> StoreResult<Option<PatientRecord>> {
        match self.get_entity(id)? {
            Some(record) => Ok(Some(record)),
            None => self.get_entity_by_alias(id),
        }
    }

    /// Records not yet confirmed by the server.
    fn list_unsynced(&self) -> StoreResult<Vec<PatientRecord>> {
        Ok(self
            .list_entities()?
            .into_iter()
            .filter(|r| r.status != SyncStatus::Synced)
            .collect())
    }
}

/// Sort key for dequeue order.
pub(crate) fn dequeue_order(a: &SyncQueueItem, b: &SyncQueueItem) -> std::cmp::Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then(a.sequence.cmp(&b.sequence))
}
