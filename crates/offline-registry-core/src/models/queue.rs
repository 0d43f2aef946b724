//! Sync queue models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Actor, PatientFields};

/// Lifecycle status shared by cache records and queue items.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// Waiting for (re)transmission
    Pending,
    /// A remote call is in flight
    Syncing,
    /// Confirmed durable on the server
    Synced,
    /// Needs operator action (retry, edit or discard)
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "syncing" => Some(SyncStatus::Syncing),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Dequeue priority. Lower rank is served first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Priority {
    Critical,
    Normal,
}

impl Priority {
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::Normal => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Normal => "normal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Priority::Critical),
            "normal" => Some(Priority::Normal),
            _ => None,
        }
    }
}

/// Mutation carried by a queue item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncAction {
    CreateEntity,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::CreateEntity => "create_entity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create_entity" => Some(SyncAction::CreateEntity),
            _ => None,
        }
    }
}

/// Entity type tag for patient records.
pub const PATIENT_ENTITY: &str = "patient";

/// A pending mutation awaiting transmission to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncQueueItem {
    /// Queue item UUID
    pub id: String,
    /// Mutation kind
    pub action: SyncAction,
    /// Entity type tag
    pub entity_type: String,
    /// Temporary ID of the target record
    pub target_id: String,
    /// Value snapshot of the fields at enqueue (or last edit) time
    pub payload: PatientFields,
    /// SHA-256 of target + payload, sent as the remote idempotency key
    pub payload_digest: String,
    /// Digest of the last snapshot handed to the remote create
    pub sent_digest: Option<String>,
    pub priority: Priority,
    pub status: SyncStatus,
    /// FIFO key within a priority tier
    pub sequence: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest time the next attempt may start (backoff)
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Server-issued ID once synced
    pub server_id: Option<String>,
    pub actor: Actor,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl SyncQueueItem {
    /// Build a create-entity item holding a snapshot of `payload`.
    pub fn create_entity(
        target_id: String,
        payload: PatientFields,
        sequence: i64,
        max_retries: u32,
        actor: Actor,
    ) -> Self {
        let now = Utc::now();
        let payload_digest = payload_digest(&target_id, &payload);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action: SyncAction::CreateEntity,
            entity_type: PATIENT_ENTITY.to_string(),
            target_id,
            payload,
            payload_digest,
            sent_digest: None,
            priority: Priority::Critical,
            status: SyncStatus::Pending,
            sequence,
            retry_count: 0,
            max_retries,
            next_attempt_at: None,
            last_error: None,
            server_id: None,
            actor,
            enqueued_at: now,
            updated_at: now,
            synced_at: None,
        }
    }

    /// Replace the payload snapshot and reset retry bookkeeping.
    pub fn replace_payload(&mut self, payload: PatientFields) {
        self.payload_digest = payload_digest(&self.target_id, &payload);
        self.payload = payload;
        self.sent_digest = None;
        self.reset_for_retry();
    }

    /// Return a failed item to the pending state with a fresh retry budget.
    pub fn reset_for_retry(&mut self) {
        self.status = SyncStatus::Pending;
        self.retry_count = 0;
        self.next_attempt_at = None;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Whether the processor may pick this item up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SyncStatus::Pending
            && self.next_attempt_at.map(|at| at <= now).unwrap_or(true)
    }

    /// Whether the current snapshot has already been sent to the server.
    ///
    /// The server may hold it even though no reply arrived.
    pub fn was_sent(&self) -> bool {
        self.sent_digest.as_deref() == Some(self.payload_digest.as_str())
    }

    /// Whether the item still counts toward local duplicate checks.
    pub fn is_open_create(&self) -> bool {
        self.action == SyncAction::CreateEntity && self.status != SyncStatus::Synced
    }
}

/// Digest of a payload snapshot, hex encoded.
pub fn payload_digest(target_id: &str, payload: &PatientFields) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target_id.as_bytes());
    hasher.update([0u8]);
    // Field order is fixed by the struct definition, so this is canonical.
    hasher.update(serde_json::to_vec(payload).unwrap_or_default());
    hex::encode(hasher.finalize())
}
