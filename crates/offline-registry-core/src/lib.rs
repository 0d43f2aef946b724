//! Offline Registry Core Library
//!
//! Offline-first patient registration for field health workers.
//!
//! # Architecture
//!
//! ```text
//! Field worker → Validation → Local duplicate check → Temporary ID
//!                                                        │
//!                                  [Entity Cache + Sync Queue, one batch]
//!                                                        │
//!                                             (device comes online)
//!                                                        │
//!                                                Sync Queue Processor
//!                                                        │
//!                                  Remote duplicate check (fail-open)
//!                                                        │
//!                                                  Remote create
//!                                                        │
//!                         ┌──────────────────────────────┼──────────────────┐
//!                         ▼                              ▼                  ▼
//!               ID Reconciliation               Pending (backoff)        Failed
//!            TEMP_… → server ID                  retry ≤ max            operator:
//!                                                                   retry / edit / discard
//! ```
//!
//! # Core Principle
//!
//! **A patient is never recorded twice, and no record is silently dropped.**
//! The local duplicate check blocks creation; failed syncs wait for the
//! operator.
//!
//! # Modules
//!
//! - [`db`]: SQLite schema and row mapping
//! - [`store`]: Durable store trait with SQLite and in-memory backends
//! - [`models`]: Domain types (PatientRecord, SyncQueueItem, Actor, etc.)
//! - [`validation`]: Declarative field validation
//! - [`duplicate`]: Local and remote duplicate detection
//! - [`sync`]: Queue processor, backoff and ID reconciliation
//! - [`registry`]: Offline creation service

pub mod audit;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod duplicate;
pub mod ids;
pub mod models;
pub mod registry;
pub mod remote;
pub mod store;
pub mod sync;
pub mod validation;

// Re-export commonly used types
pub use audit::{AuditAction, AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::SyncConfig;
pub use connectivity::ConnectivityMonitor;
pub use db::Database;
pub use duplicate::{DuplicateMatch, DuplicateSource, MatchReason};
pub use ids::TempIdGenerator;
pub use models::{
    Actor, ActorRole, PatientEdits, PatientFields, PatientRecord, Priority, SyncQueueItem,
    SyncStatus,
};
pub use registry::{
    CreateError, CreatedRecord, OfflineRegistry, QueueStats, RegistryError, RetryReceipt,
};
pub use remote::{HttpRemoteRegistry, RemoteError, RemoteRegistry};
pub use store::{LocalStore, MemoryStore, SqliteStore};
pub use sync::{PassReport, SyncEvent, SyncProcessor};
pub use validation::{FieldError, Validator};

// UniFFI setup - using proc macros
uniffi::setup_scaffolding!();

use std::sync::Arc;

// =========================================================================
// FFI Error Type
// =========================================================================

#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum OfflineRegistryError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Sync error: {0}")]
    SyncError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

impl From<store::StoreError> for OfflineRegistryError {
    fn from(e: store::StoreError) -> Self {
        OfflineRegistryError::StorageError(e.to_string())
    }
}

impl From<db::DbError> for OfflineRegistryError {
    fn from(e: db::DbError) -> Self {
        OfflineRegistryError::StorageError(e.to_string())
    }
}

impl From<serde_json::Error> for OfflineRegistryError {
    fn from(e: serde_json::Error) -> Self {
        OfflineRegistryError::InvalidInput(e.to_string())
    }
}

impl From<std::io::Error> for OfflineRegistryError {
    fn from(e: std::io::Error) -> Self {
        OfflineRegistryError::RuntimeError(e.to_string())
    }
}

impl From<sync::SyncError> for OfflineRegistryError {
    fn from(e: sync::SyncError) -> Self {
        OfflineRegistryError::SyncError(e.to_string())
    }
}

impl From<RegistryError> for OfflineRegistryError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => OfflineRegistryError::NotFound(id),
            RegistryError::InvalidState { .. } => OfflineRegistryError::InvalidState(e.to_string()),
            RegistryError::Validation(_) | RegistryError::Duplicate(_) => {
                OfflineRegistryError::InvalidInput(e.to_string())
            }
            RegistryError::Storage(e) => e.into(),
            RegistryError::Sync(e) => e.into(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for OfflineRegistryError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        OfflineRegistryError::StorageError(format!("Lock poisoned: {}", e))
    }
}

// =========================================================================
// Logging
// =========================================================================

/// Install the tracing subscriber. Safe to call more than once.
///
/// Filter comes from `RUST_LOG`, defaulting to debug for this crate.
#[uniffi::export]
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("offline_registry_core=debug,info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

// =========================================================================
// Factory Functions (exported to FFI)
// =========================================================================

/// Open or create a registry backed by the database at `path`.
///
/// `config_json` overrides [`SyncConfig`] defaults key by key.
#[uniffi::export]
pub fn open_registry(
    path: String,
    base_url: String,
    config_json: Option<String>,
) -> Result<Arc<OfflineRegistryCore>, OfflineRegistryError> {
    let store = Arc::new(SqliteStore::open(&path)?);
    OfflineRegistryCore::build(store, base_url, config_json)
}

/// Create a registry over an in-memory database (for testing).
#[uniffi::export]
pub fn open_registry_in_memory(
    base_url: String,
) -> Result<Arc<OfflineRegistryCore>, OfflineRegistryError> {
    let store = Arc::new(SqliteStore::open_in_memory()?);
    OfflineRegistryCore::build(store, base_url, None)
}

// =========================================================================
// Callbacks
// =========================================================================

/// Host-side listener for temporary to permanent ID changes.
#[uniffi::export(callback_interface)]
pub trait ReconciliationListener: Send + Sync {
    fn on_reconciled(&self, temporary_id: String, server_id: String);
}

// =========================================================================
// Main API Object
// =========================================================================

/// Registry handle for FFI. Owns the runtime the sync processor runs on.
#[derive(uniffi::Object)]
pub struct OfflineRegistryCore {
    registry: OfflineRegistry,
    runtime: tokio::runtime::Runtime,
}

impl OfflineRegistryCore {
    fn build(
        store: Arc<dyn LocalStore>,
        base_url: String,
        config_json: Option<String>,
    ) -> Result<Arc<Self>, OfflineRegistryError> {
        let config = match config_json {
            Some(json) => SyncConfig::from_json_str(&json)?,
            None => SyncConfig::default(),
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("offline-registry-sync")
            .enable_all()
            .build()?;

        let registry = OfflineRegistry::new(
            store,
            Arc::new(HttpRemoteRegistry::new(base_url)),
            Arc::new(TracingAuditSink),
            config,
        )?;

        Ok(Arc::new(Self { registry, runtime }))
    }
}

#[uniffi::export]
impl OfflineRegistryCore {
    // =========================================================================
    // Patient Operations
    // =========================================================================

    /// Register a patient while offline.
    ///
    /// Validation failures and duplicates are reported in the result, not
    /// as errors.
    pub fn create_patient_offline(
        &self,
        fields: FfiPatientFields,
        actor: FfiActor,
    ) -> Result<FfiCreateResult, OfflineRegistryError> {
        let actor: Actor = actor.try_into()?;
        match self.registry.create_offline(fields.into(), &actor) {
            Ok(created) => Ok(FfiCreateResult {
                success: true,
                temporary_id: Some(created.temporary_id),
                errors: Vec::new(),
                duplicate_source: None,
                duplicate_of: None,
            }),
            Err(CreateError::Validation(errors)) => Ok(FfiCreateResult {
                success: false,
                temporary_id: None,
                errors: errors.into_iter().map(Into::into).collect(),
                duplicate_source: None,
                duplicate_of: None,
            }),
            Err(CreateError::Duplicate(found)) => Ok(FfiCreateResult {
                success: false,
                temporary_id: None,
                errors: Vec::new(),
                duplicate_source: Some(found.source.as_str().to_string()),
                duplicate_of: Some(found.matched_id),
            }),
            Err(CreateError::Storage(e)) => Err(e.into()),
        }
    }

    /// Retry a failed record, optionally with edited fields.
    pub fn retry(
        &self,
        id: String,
        edits: Option<FfiPatientEdits>,
        actor: FfiActor,
    ) -> Result<FfiRetryResult, OfflineRegistryError> {
        let actor: Actor = actor.try_into()?;
        match self.registry.retry(&id, edits.map(Into::into), &actor) {
            Ok(receipt) => Ok(FfiRetryResult {
                success: true,
                message: receipt.message,
            }),
            Err(e @ (RegistryError::Validation(_) | RegistryError::Duplicate(_))) => {
                Ok(FfiRetryResult {
                    success: false,
                    message: e.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Discard a failed record.
    pub fn discard(&self, id: String, actor: FfiActor) -> Result<(), OfflineRegistryError> {
        let actor: Actor = actor.try_into()?;
        self.registry.discard(&id, &actor)?;
        Ok(())
    }

    /// Records not yet synced, oldest first.
    pub fn list_pending(&self) -> Result<Vec<FfiPatientRecord>, OfflineRegistryError> {
        let records = self.registry.list_pending()?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    /// Get a patient by current or temporary ID.
    pub fn get_patient(&self, id: String) -> Result<Option<FfiPatientRecord>, OfflineRegistryError> {
        Ok(self.registry.get(&id)?.map(Into::into))
    }

    /// Seed the cache with a patient the server already holds.
    pub fn cache_server_record(
        &self,
        server_id: String,
        fields: FfiPatientFields,
        actor: FfiActor,
    ) -> Result<FfiPatientRecord, OfflineRegistryError> {
        let actor: Actor = actor.try_into()?;
        let record = self
            .registry
            .cache_server_record(&server_id, fields.into(), &actor)?;
        Ok(record.into())
    }

    // =========================================================================
    // Sync Operations
    // =========================================================================

    /// Report platform connectivity.
    pub fn set_online(&self, online: bool) {
        self.registry.set_online(online);
    }

    /// Start the background sync loop.
    pub fn start_sync(&self) -> Result<(), OfflineRegistryError> {
        let _guard = self.runtime.enter();
        self.registry.start()?;
        Ok(())
    }

    /// Stop the background sync loop.
    pub fn stop_sync(&self) {
        self.registry.stop();
    }

    /// Run one sync pass and wait for it.
    pub fn sync_now(&self) -> Result<FfiPassReport, OfflineRegistryError> {
        let report = self.runtime.block_on(self.registry.sync_now())?;
        Ok(report.into())
    }

    /// Get queue counts by status.
    pub fn queue_stats(&self) -> Result<FfiQueueStats, OfflineRegistryError> {
        Ok(self.registry.stats()?.into())
    }

    /// Delete synced queue items older than the given number of hours.
    pub fn prune_synced(&self, older_than_hours: u32) -> Result<u32, OfflineRegistryError> {
        let pruned = self
            .registry
            .prune_synced(chrono::Duration::hours(older_than_hours as i64))?;
        Ok(pruned as u32)
    }

    /// Register a listener for ID reconciliation.
    pub fn register_reconciliation_listener(&self, listener: Box<dyn ReconciliationListener>) {
        let _guard = self.runtime.enter();
        self.registry.on_reconciled(move |temporary_id, server_id| {
            listener.on_reconciled(temporary_id.to_string(), server_id.to_string())
        });
    }
}

// =========================================================================
// FFI Types
// =========================================================================

/// FFI-safe actor.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiActor {
    pub id: String,
    /// Role tag or name ("PHC", "ASHA", "ANM", "Doctor", "Admin")
    pub role: String,
}

impl TryFrom<FfiActor> for Actor {
    type Error = OfflineRegistryError;

    fn try_from(actor: FfiActor) -> Result<Self, Self::Error> {
        let role = ActorRole::parse(&actor.role).ok_or_else(|| {
            OfflineRegistryError::InvalidInput(format!("Unknown role: {}", actor.role))
        })?;
        Ok(Actor::new(actor.id, role))
    }
}

/// FFI-safe patient fields.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPatientFields {
    pub name: String,
    pub guardian_name: Option<String>,
    pub phone: String,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub diagnosis: Option<String>,
    pub phc: String,
    pub village: Option<String>,
    pub systolic_bp: Option<u32>,
    pub diastolic_bp: Option<u32>,
    pub notes: Option<String>,
}

impl From<FfiPatientFields> for PatientFields {
    fn from(f: FfiPatientFields) -> Self {
        PatientFields {
            name: f.name,
            guardian_name: f.guardian_name,
            phone: f.phone,
            age: f.age,
            gender: f.gender,
            diagnosis: f.diagnosis,
            phc: f.phc,
            village: f.village,
            systolic_bp: f.systolic_bp,
            diastolic_bp: f.diastolic_bp,
            notes: f.notes,
        }
    }
}

impl From<PatientFields> for FfiPatientFields {
    fn from(f: PatientFields) -> Self {
        Self {
            name: f.name,
            guardian_name: f.guardian_name,
            phone: f.phone,
            age: f.age,
            gender: f.gender,
            diagnosis: f.diagnosis,
            phc: f.phc,
            village: f.village,
            systolic_bp: f.systolic_bp,
            diastolic_bp: f.diastolic_bp,
            notes: f.notes,
        }
    }
}

/// FFI-safe field edits for retry.
#[derive(Debug, Clone, Default, uniffi::Record)]
pub struct FfiPatientEdits {
    pub name: Option<String>,
    pub guardian_name: Option<String>,
    pub phone: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub diagnosis: Option<String>,
    pub phc: Option<String>,
    pub village: Option<String>,
    pub systolic_bp: Option<u32>,
    pub diastolic_bp: Option<u32>,
    pub notes: Option<String>,
}

impl From<FfiPatientEdits> for PatientEdits {
    fn from(e: FfiPatientEdits) -> Self {
        PatientEdits {
            name: e.name,
            guardian_name: e.guardian_name,
            phone: e.phone,
            age: e.age,
            gender: e.gender,
            diagnosis: e.diagnosis,
            phc: e.phc,
            village: e.village,
            systolic_bp: e.systolic_bp,
            diastolic_bp: e.diastolic_bp,
            notes: e.notes,
        }
    }
}

/// FFI-safe cached patient record.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPatientRecord {
    pub id: String,
    pub temporary_alias: Option<String>,
    pub status: String,
    pub fields: FfiPatientFields,
    pub sync_attempts: u32,
    pub last_error: Option<String>,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<PatientRecord> for FfiPatientRecord {
    fn from(record: PatientRecord) -> Self {
        Self {
            id: record.id,
            temporary_alias: record.temporary_alias,
            status: record.status.as_str().to_string(),
            fields: record.fields.into(),
            sync_attempts: record.sync.attempts,
            last_error: record.sync.last_error,
            created_by: record.sync.created_by.id,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// FFI-safe validation error.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiFieldError {
    pub field: String,
    pub message: String,
}

impl From<FieldError> for FfiFieldError {
    fn from(e: FieldError) -> Self {
        Self {
            field: e.field,
            message: e.message,
        }
    }
}

/// Result of an offline create.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiCreateResult {
    pub success: bool,
    pub temporary_id: Option<String>,
    pub errors: Vec<FfiFieldError>,
    /// "cached" or "queued" when rejected as a duplicate
    pub duplicate_source: Option<String>,
    pub duplicate_of: Option<String>,
}

/// Result of an operator retry.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiRetryResult {
    pub success: bool,
    pub message: String,
}

/// FFI-safe sync pass summary.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPassReport {
    pub attempted: u32,
    pub synced: u32,
    pub retried: u32,
    pub failed: u32,
    pub next_due: Option<String>,
}

impl From<PassReport> for FfiPassReport {
    fn from(report: PassReport) -> Self {
        Self {
            attempted: report.attempted as u32,
            synced: report.synced as u32,
            retried: report.retried as u32,
            failed: report.failed as u32,
            next_due: report.next_due.map(|at| at.to_rfc3339()),
        }
    }
}

/// FFI-safe queue counts.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiQueueStats {
    pub pending: u32,
    pub syncing: u32,
    pub synced: u32,
    pub failed: u32,
}

impl From<QueueStats> for FfiQueueStats {
    fn from(stats: QueueStats) -> Self {
        Self {
            pending: stats.pending as u32,
            syncing: stats.syncing as u32,
            synced: stats.synced as u32,
            failed: stats.failed as u32,
        }
    }
}
