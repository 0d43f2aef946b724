//! Offline creation service.
//!
//! [`OfflineRegistry`] is the entry point for foreground callers. It
//! validates and de-duplicates new records, persists them together with
//! their sync queue item, and exposes the operator actions (retry, discard)
//! for records the processor could not sync.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::duplicate::{DuplicateMatch, DuplicateSource, LocalDuplicateDetector};
use crate::ids::{self, TempIdGenerator};
use crate::models::{
    Actor, PatientEdits, PatientFields, PatientRecord, SyncQueueItem, SyncStatus,
};
use crate::remote::RemoteRegistry;
use crate::store::{LocalStore, StoreError, WriteBatch};
use crate::sync::{ItemLocks, PassReport, SyncError, SyncEvent, SyncProcessor};
use crate::validation::{FieldError, Validator};

/// Capacity of the sync event channel.
const EVENT_CAPACITY: usize = 256;

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Rejection from `create_offline`. Nothing is persisted in any case.
#[derive(Error, Debug)]
pub enum CreateError {
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("Patient is a {0}")]
    Duplicate(DuplicateMatch),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl CreateError {
    pub fn duplicate_source(&self) -> Option<DuplicateSource> {
        match self {
            CreateError::Duplicate(m) => Some(m.source),
            _ => None,
        }
    }

    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            CreateError::Validation(errors) => errors,
            _ => &[],
        }
    }
}

/// Errors from operator actions and queries.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record {id} is {}, expected failed", .status.as_str())]
    InvalidState { id: String, status: SyncStatus },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("Edited patient is a {0}")]
    Duplicate(DuplicateMatch),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

impl<T> From<std::sync::PoisonError<T>> for RegistryError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        RegistryError::Storage(StoreError::Poisoned(e.to_string()))
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// A record accepted for offline creation.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedRecord {
    pub temporary_id: String,
    pub record: PatientRecord,
}

/// Acknowledgement of an operator retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReceipt {
    pub temporary_id: String,
    /// Whether the payload snapshot was replaced
    pub edited: bool,
    /// Message for display
    pub message: String,
}

/// Queue item counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
}

/// Offline patient registry.
pub struct OfflineRegistry {
    store: Arc<dyn LocalStore>,
    validator: Validator,
    duplicates: LocalDuplicateDetector,
    ids: TempIdGenerator,
    processor: Arc<SyncProcessor>,
    connectivity: Arc<ConnectivityMonitor>,
    audit: Arc<dyn AuditSink>,
    locks: Arc<ItemLocks>,
    events: broadcast::Sender<SyncEvent>,
    config: SyncConfig,
    /// Serializes duplicate check + enqueue
    admission: Mutex<()>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineRegistry {
    /// Build a registry over an existing store.
    ///
    /// Starts offline. Any attempt interrupted by a previous shutdown is
    /// returned to Pending, and the temporary ID generator resumes after the
    /// newest temporary ID in the store.
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteRegistry>,
        audit: Arc<dyn AuditSink>,
        config: SyncConfig,
    ) -> RegistryResult<Self> {
        let connectivity = Arc::new(ConnectivityMonitor::new(false));
        let locks = Arc::new(ItemLocks::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let processor = Arc::new(SyncProcessor::new(
            Arc::clone(&store),
            remote,
            Arc::clone(&connectivity),
            Arc::clone(&audit),
            Arc::clone(&locks),
            events.clone(),
            config.clone(),
        ));

        let recovered = processor.recover_interrupted()?;
        if recovered > 0 {
            info!(recovered, "Returned interrupted items to the queue");
        }

        let ids = TempIdGenerator::resume_after(last_temporary_timestamp(store.as_ref())?);

        Ok(Self {
            duplicates: LocalDuplicateDetector::new(Arc::clone(&store)),
            validator: Validator::patient_defaults(),
            admission: Mutex::new(()),
            background: Mutex::new(None),
            store,
            ids,
            processor,
            connectivity,
            audit,
            locks,
            events,
            config,
        })
    }

    /// Replace the validation rule set.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a patient record while offline.
    ///
    /// On success the record is in the entity cache as Pending under a fresh
    /// temporary ID and has exactly one queue item. On any error nothing is
    /// written.
    pub fn create_offline(
        &self,
        fields: PatientFields,
        actor: &Actor,
    ) -> Result<CreatedRecord, CreateError> {
        self.validator
            .validate(&fields)
            .into_result()
            .map_err(CreateError::Validation)?;

        let _admission = self.admission.lock().map_err(StoreError::from)?;

        if let Some(found) = self.duplicates.check(&fields, None)? {
            info!(matched_id = %found.matched_id, source = found.source.as_str(), "Duplicate rejected");
            return Err(CreateError::Duplicate(found));
        }

        let temporary_id = self.ids.next(actor);
        let sequence = ids::timestamp_of(&temporary_id)
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        let record = PatientRecord::new_pending(
            temporary_id.clone(),
            fields.clone(),
            actor.clone(),
            self.config.max_retries,
        );
        let item = SyncQueueItem::create_entity(
            temporary_id.clone(),
            fields,
            sequence,
            self.config.max_retries,
            actor.clone(),
        );
        let queue_id = item.id.clone();

        self.store
            .apply(WriteBatch::new().put_entity(record.clone()).put_queue_item(item))?;

        info!(temp_id = %temporary_id, queue_id = %queue_id, "Patient created offline");
        self.audit.record(AuditEvent::new(
            AuditAction::CreateOffline,
            &temporary_id,
            serde_json::to_value(&record.fields).unwrap_or_default(),
            actor,
        ));
        self.processor.nudge();

        Ok(CreatedRecord {
            temporary_id,
            record,
        })
    }

    // =========================================================================
    // Operator actions
    // =========================================================================

    /// Put a Failed record back in the queue, optionally with edited fields.
    ///
    /// Edits replace the payload snapshot. The retry budget starts again
    /// from zero either way.
    pub fn retry(
        &self,
        id: &str,
        edits: Option<PatientEdits>,
        actor: &Actor,
    ) -> RegistryResult<RetryReceipt> {
        let record = self.require_failed(id)?;
        let temporary_id = record.id.clone();

        let edits = edits.filter(|e| !e.is_empty());
        let fields = match &edits {
            Some(e) => record.fields.with_edits(e),
            None => record.fields.clone(),
        };
        let edited = fields != record.fields;

        self.validator
            .validate(&fields)
            .into_result()
            .map_err(RegistryError::Validation)?;

        let _admission = self.admission.lock()?;

        if let Some(found) = self.duplicates.check(&fields, Some(&temporary_id))? {
            return Err(RegistryError::Duplicate(found));
        }

        self.locks.with(&temporary_id, || -> RegistryResult<()> {
            let mut record = self.require_failed(&temporary_id)?;
            let mut item = self
                .store
                .get_queue_item_for_target(&temporary_id)?
                .ok_or_else(|| RegistryError::NotFound(temporary_id.clone()))?;

            if edited {
                item.replace_payload(fields.clone());
            } else {
                item.reset_for_retry();
            }
            record.fields = fields.clone();
            record.status = SyncStatus::Pending;
            record.sync.last_error = None;
            record.touch();

            self.store
                .apply(WriteBatch::new().put_entity(record).put_queue_item(item))?;
            Ok(())
        })?;

        info!(temp_id = %temporary_id, edited, "Retry requested");
        self.audit.record(AuditEvent::new(
            AuditAction::RetryRequested,
            &temporary_id,
            serde_json::json!({ "edited": edited, "fields": fields }),
            actor,
        ));
        self.processor.nudge();

        let message = if edited {
            "Changes saved, record queued for sync"
        } else {
            "Record queued for sync"
        };
        Ok(RetryReceipt {
            temporary_id,
            edited,
            message: message.to_string(),
        })
    }

    /// Permanently remove a Failed record and its queue item.
    ///
    /// The discarded snapshot is kept in the audit event.
    pub fn discard(&self, id: &str, actor: &Actor) -> RegistryResult<()> {
        let temporary_id = self.require_failed(id)?.id;

        let snapshot = self.locks.with(&temporary_id, || -> RegistryResult<PatientRecord> {
            let record = self.require_failed(&temporary_id)?;
            let mut batch = WriteBatch::new().delete_entity(&temporary_id);
            if let Some(item) = self.store.get_queue_item_for_target(&temporary_id)? {
                batch = batch.delete_queue_item(item.id);
            }
            self.store.apply(batch)?;
            Ok(record)
        })?;

        warn!(temp_id = %temporary_id, "Failed record discarded");
        self.audit.record(
            AuditEvent::new(
                AuditAction::Discarded,
                &temporary_id,
                serde_json::to_value(&snapshot).unwrap_or_default(),
                actor,
            )
            .with_note(snapshot.sync.last_error.unwrap_or_default()),
        );
        Ok(())
    }

    fn require_failed(&self, id: &str) -> RegistryResult<PatientRecord> {
        let record = self
            .store
            .resolve_entity(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if record.status != SyncStatus::Failed {
            return Err(RegistryError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }
        Ok(record)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Records not yet confirmed by the server, oldest first.
    pub fn list_pending(&self) -> RegistryResult<Vec<PatientRecord>> {
        Ok(self.store.list_unsynced()?)
    }

    /// Look a record up by current id or former temporary id.
    pub fn get(&self, id: &str) -> RegistryResult<Option<PatientRecord>> {
        Ok(self.store.resolve_entity(id)?)
    }

    /// Queue item for a record, by current id or temporary id.
    pub fn queue_item(&self, id: &str) -> RegistryResult<Option<SyncQueueItem>> {
        let target = match self.store.resolve_entity(id)? {
            Some(record) => record.temporary_id().unwrap_or(id).to_string(),
            None => id.to_string(),
        };
        Ok(self.store.get_queue_item_for_target(&target)?)
    }

    pub fn stats(&self) -> RegistryResult<QueueStats> {
        let mut stats = QueueStats::default();
        for item in self.store.list_queue_items()? {
            match item.status {
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::Syncing => stats.syncing += 1,
                SyncStatus::Synced => stats.synced += 1,
                SyncStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    // =========================================================================
    // Sync control
    // =========================================================================

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    /// Report platform connectivity.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Run one processor pass now.
    pub async fn sync_now(&self) -> RegistryResult<PassReport> {
        Ok(self.processor.run_pass().await?)
    }

    /// Start the background processor loop. Calling twice is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> RegistryResult<()> {
        let mut background = self.background.lock()?;
        if background.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Ok(());
        }
        *background = Some(Arc::clone(&self.processor).spawn());
        debug!("Sync processor started");
        Ok(())
    }

    /// Stop the background loop. In-flight attempts are abandoned and
    /// recovered on the next start.
    pub fn stop(&self) {
        if let Ok(mut background) = self.background.lock() {
            if let Some(handle) = background.take() {
                handle.abort();
            }
        }
    }

    pub fn processor(&self) -> &Arc<SyncProcessor> {
        &self.processor
    }

    /// Subscribe to reconciliation and failure events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Call `callback(temporary_id, server_id)` for every reconciliation.
    ///
    /// Must be called from within a tokio runtime. The listener ends when the
    /// registry is dropped.
    pub fn on_reconciled<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&str, &str) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SyncEvent::Reconciled {
                        temporary_id,
                        server_id,
                    }) => callback(&temporary_id, &server_id),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Reconciliation listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // =========================================================================
    // Cache maintenance
    // =========================================================================

    /// Store a server-confirmed patient in the entity cache.
    ///
    /// Local duplicate checks see it from then on.
    pub fn cache_server_record(
        &self,
        server_id: &str,
        fields: PatientFields,
        actor: &Actor,
    ) -> RegistryResult<PatientRecord> {
        let record = match self.store.get_entity(server_id)? {
            Some(mut existing) if existing.is_synced() => {
                existing.fields = fields;
                existing.touch();
                existing
            }
            Some(existing) => {
                return Err(RegistryError::InvalidState {
                    id: server_id.to_string(),
                    status: existing.status,
                })
            }
            None => {
                let mut record = PatientRecord::new_pending(
                    server_id.to_string(),
                    fields,
                    actor.clone(),
                    self.config.max_retries,
                );
                record.status = SyncStatus::Synced;
                record
            }
        };

        self.store.apply(WriteBatch::new().put_entity(record.clone()))?;
        debug!(server_id = %server_id, "Cached server record");
        Ok(record)
    }

    /// Delete Synced queue items older than `older_than`.
    pub fn prune_synced(&self, older_than: chrono::Duration) -> RegistryResult<usize> {
        let cutoff = Utc::now() - older_than;
        let stale: Vec<String> = self
            .store
            .list_queue_items()?
            .into_iter()
            .filter(|i| i.status == SyncStatus::Synced)
            .filter(|i| i.synced_at.map(|at| at <= cutoff).unwrap_or(false))
            .map(|i| i.id)
            .collect();

        let count = stale.len();
        let batch = stale
            .into_iter()
            .fold(WriteBatch::new(), |batch, id| batch.delete_queue_item(id));
        self.store.apply(batch)?;
        if count > 0 {
            debug!(count, "Pruned synced queue items");
        }
        Ok(count)
    }
}

impl Drop for OfflineRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Newest temporary-ID timestamp present in the store.
fn last_temporary_timestamp(store: &dyn LocalStore) -> Result<i64, StoreError> {
    let from_entities = store
        .list_entities()?
        .into_iter()
        .filter_map(|r| r.temporary_id().and_then(ids::timestamp_of));
    let from_queue = store
        .list_queue_items()?
        .into_iter()
        .filter_map(|i| ids::timestamp_of(&i.target_id));

    Ok(from_entities.chain(from_queue).max().unwrap_or(0))
}
