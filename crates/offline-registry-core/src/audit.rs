//! Audit trail of record lifecycle transitions.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::Actor;

/// Lifecycle transition being audited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AuditAction {
    CreateOffline,
    SyncStarted,
    SyncRetryScheduled,
    SyncFailed,
    Reconciled,
    RetryRequested,
    Discarded,
    RecoveredInterrupted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::CreateOffline => "create_offline",
            AuditAction::SyncStarted => "sync_started",
            AuditAction::SyncRetryScheduled => "sync_retry_scheduled",
            AuditAction::SyncFailed => "sync_failed",
            AuditAction::Reconciled => "reconciled",
            AuditAction::RetryRequested => "retry_requested",
            AuditAction::Discarded => "discarded",
            AuditAction::RecoveredInterrupted => "recovered_interrupted",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub entity_type: String,
    /// Temporary or permanent id, whichever was current at the time
    pub entity_id: String,
    /// Snapshot relevant to the transition (fields, error, server id)
    pub payload: serde_json::Value,
    pub actor: Actor,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
        actor: &Actor,
    ) -> Self {
        Self {
            action,
            entity_type: crate::models::PATIENT_ENTITY.to_string(),
            entity_id: entity_id.into(),
            payload,
            actor: actor.clone(),
            note: None,
            at: Utc::now(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Destination for audit events.
///
/// Recording must not fail the transition it describes, so sinks swallow
/// their own errors.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            action = event.action.as_str(),
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            actor = %event.actor.id,
            role = event.actor.role.tag(),
            note = event.note.as_deref().unwrap_or(""),
            payload = %event.payload,
            "audit"
        );
    }
}

/// Keeps events in memory. Useful for hosts that ship audit logs in bulk.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Actions recorded for one entity id.
    pub fn actions_for(&self, entity_id: &str) -> Vec<AuditAction> {
        self.events()
            .into_iter()
            .filter(|e| e.entity_id == entity_id)
            .map(|e| e.action)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
