//! Reconciliation of temporary IDs to permanent server IDs.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{ItemLocks, SyncError, SyncEvent, SyncResult};
use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::models::{Actor, PatientRecord, SyncStatus};
use crate::store::{LocalStore, WriteBatch};

/// Result of a reconcile call.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The record was moved to its server ID by this call
    Reconciled(PatientRecord),
    /// The same pair was applied earlier; nothing changed
    AlreadyReconciled(PatientRecord),
}

impl ReconcileOutcome {
    pub fn record(&self) -> &PatientRecord {
        match self {
            ReconcileOutcome::Reconciled(r) | ReconcileOutcome::AlreadyReconciled(r) => r,
        }
    }
}

/// Moves records from temporary to permanent IDs.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn LocalStore>,
    locks: Arc<ItemLocks>,
    events: broadcast::Sender<SyncEvent>,
    audit: Arc<dyn AuditSink>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LocalStore>,
        locks: Arc<ItemLocks>,
        events: broadcast::Sender<SyncEvent>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            locks,
            events,
            audit,
        }
    }

    /// Re-key the record created as `temporary_id` under `server_id`.
    ///
    /// The entity keeps `temporary_id` as its alias, both the entity and its
    /// queue item become Synced, and subscribers receive
    /// [`SyncEvent::Reconciled`]. Repeating the call with the same pair is a
    /// no-op.
    pub fn reconcile(&self, temporary_id: &str, server_id: &str) -> SyncResult<ReconcileOutcome> {
        let outcome = self.locks.with(temporary_id, || -> SyncResult<ReconcileOutcome> {
            if let Some(existing) = self.store.get_entity_by_alias(temporary_id)? {
                if existing.id == server_id {
                    return Ok(ReconcileOutcome::AlreadyReconciled(existing));
                }
                return Err(SyncError::PermanentIdConflict {
                    temporary_id: temporary_id.to_string(),
                    existing: existing.id,
                    requested: server_id.to_string(),
                });
            }

            let mut record = self
                .store
                .get_entity(temporary_id)?
                .ok_or_else(|| SyncError::NotFound(temporary_id.to_string()))?;

            record.id = server_id.to_string();
            record.temporary_alias = Some(temporary_id.to_string());
            record.status = SyncStatus::Synced;
            record.sync.last_error = None;
            record.touch();

            let mut batch = WriteBatch::new()
                .delete_entity(temporary_id)
                .put_entity(record.clone());

            if let Some(mut item) = self.store.get_queue_item_for_target(temporary_id)? {
                let now = Utc::now();
                item.status = SyncStatus::Synced;
                item.server_id = Some(server_id.to_string());
                item.synced_at = Some(now);
                item.next_attempt_at = None;
                item.last_error = None;
                item.updated_at = now;
                batch = batch.put_queue_item(item);
            }

            self.store.apply(batch)?;
            Ok(ReconcileOutcome::Reconciled(record))
        })?;

        match &outcome {
            ReconcileOutcome::Reconciled(_) => {
                info!(temp_id = %temporary_id, server_id = %server_id, "Record reconciled");
                self.audit.record(AuditEvent::new(
                    AuditAction::Reconciled,
                    server_id,
                    serde_json::json!({
                        "temporary_id": temporary_id,
                        "server_id": server_id,
                    }),
                    &Actor::system(),
                ));
                // No receivers is fine: nobody is displaying the record.
                let _ = self.events.send(SyncEvent::Reconciled {
                    temporary_id: temporary_id.to_string(),
                    server_id: server_id.to_string(),
                });
            }
            ReconcileOutcome::AlreadyReconciled(_) => {
                debug!(temp_id = %temporary_id, server_id = %server_id, "Already reconciled");
            }
        }

        Ok(outcome)
    }
}
