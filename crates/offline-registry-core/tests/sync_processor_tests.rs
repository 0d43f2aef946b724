//! Sync queue processor tests: ordering, concurrency, connectivity and
//! durability.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{asha_devi, fast_config, harness, patient, phc_worker, CreateReply, ScriptedRemote};
use offline_registry_core::models::{PatientRecord, Priority, SyncQueueItem, SyncStatus};
use offline_registry_core::store::{LocalStore, StoreError, StoreResult, WriteBatch, WriteOp};
use offline_registry_core::sync::SyncEvent;
use offline_registry_core::{
    AuditAction, MemoryAuditSink, MemoryStore, OfflineRegistry, SqliteStore, SyncConfig,
};

/// Memory store whose first reconciliation batch fails.
struct FailingReconcileStore {
    inner: MemoryStore,
    armed: AtomicBool,
}

impl FailingReconcileStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(true),
        }
    }
}

impl LocalStore for FailingReconcileStore {
    fn get_entity(&self, id: &str) -> StoreResult<Option<PatientRecord>> {
        self.inner.get_entity(id)
    }

    fn get_entity_by_alias(&self, alias: &str) -> StoreResult<Option<PatientRecord>> {
        self.inner.get_entity_by_alias(alias)
    }

    fn list_entities(&self) -> StoreResult<Vec<PatientRecord>> {
        self.inner.list_entities()
    }

    fn get_queue_item(&self, id: &str) -> StoreResult<Option<SyncQueueItem>> {
        self.inner.get_queue_item(id)
    }

    fn get_queue_item_for_target(&self, target_id: &str) -> StoreResult<Option<SyncQueueItem>> {
        self.inner.get_queue_item_for_target(target_id)
    }

    fn list_queue_items(&self) -> StoreResult<Vec<SyncQueueItem>> {
        self.inner.list_queue_items()
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        let reconciles = batch
            .ops()
            .iter()
            .any(|op| matches!(op, WriteOp::DeleteEntity(_)));
        if reconciles && self.armed.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Poisoned("disk I/O error".into()));
        }
        self.inner.apply(batch)
    }
}

#[tokio::test]
async fn test_offline_pass_attempts_nothing() {
    let h = harness(fast_config());
    h.registry
        .create_offline(asha_devi(), &phc_worker())
        .unwrap();

    let report = h.registry.sync_now().await.unwrap();

    assert_eq!(report.attempted, 0);
    assert!(report.next_due.is_some());
    assert!(h.remote.requests().is_empty());
    assert_eq!(h.registry.stats().unwrap().pending, 1);
}

#[tokio::test]
async fn test_priority_then_fifo_order() {
    let h = harness(SyncConfig {
        worker_limit: 1,
        ..fast_config()
    });
    let ids: Vec<String> = (0..4)
        .map(|n| {
            h.registry
                .create_offline(patient(n), &phc_worker())
                .unwrap()
                .temporary_id
        })
        .collect();

    // Demote the oldest item; it should go last.
    let mut demoted = h.store.get_queue_item_for_target(&ids[0]).unwrap().unwrap();
    demoted.priority = Priority::Normal;
    h.store
        .apply(WriteBatch::new().put_queue_item(demoted))
        .unwrap();

    h.registry.set_online(true);
    h.registry.sync_now().await.unwrap();

    assert_eq!(
        h.remote.requested_ids(),
        vec![ids[1].clone(), ids[2].clone(), ids[3].clone(), ids[0].clone()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_limit_bounds_concurrency() {
    let h = harness(SyncConfig {
        worker_limit: 2,
        ..fast_config()
    });
    for n in 0..6 {
        h.registry
            .create_offline(patient(n), &phc_worker())
            .unwrap();
    }
    h.remote.set_latency(Duration::from_millis(40));
    h.registry.set_online(true);

    let report = h.registry.sync_now().await.unwrap();

    assert_eq!(report.synced, 6);
    assert!(h.remote.max_in_flight() <= 2);
    assert!(h.remote.max_in_flight() >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_passes_attempt_each_item_once() {
    let h = harness(fast_config());
    for n in 0..5 {
        h.registry
            .create_offline(patient(n), &phc_worker())
            .unwrap();
    }
    h.remote.set_latency(Duration::from_millis(30));
    h.registry.set_online(true);

    let (a, b) = tokio::join!(h.registry.sync_now(), h.registry.sync_now());
    let synced = a.unwrap().synced + b.unwrap().synced;

    assert_eq!(synced, 5);
    let mut requested = h.remote.requested_ids();
    requested.sort();
    requested.dedup();
    assert_eq!(requested.len(), 5);
    assert_eq!(h.remote.requests().len(), 5);
}

#[tokio::test]
async fn test_going_offline_halts_dispatch_but_finishes_in_flight() {
    let h = harness(SyncConfig {
        worker_limit: 1,
        ..fast_config()
    });
    let ids: Vec<String> = (0..3)
        .map(|n| {
            h.registry
                .create_offline(patient(n), &phc_worker())
                .unwrap()
                .temporary_id
        })
        .collect();
    h.remote
        .disconnect_after_create(Arc::clone(h.registry.connectivity()));
    h.registry.set_online(true);

    let report = h.registry.sync_now().await.unwrap();

    assert_eq!(report.synced, 1);
    assert!(h.registry.get(&ids[0]).unwrap().unwrap().is_synced());
    assert_eq!(h.registry.stats().unwrap().pending, 2);
    assert!(!h.registry.connectivity().is_online());
}

#[tokio::test]
async fn test_backoff_defers_next_attempt() {
    let h = harness(SyncConfig {
        base_delay_ms: 60_000,
        max_delay_ms: 600_000,
        ..fast_config()
    });
    let created = h
        .registry
        .create_offline(asha_devi(), &phc_worker())
        .unwrap();
    h.registry.set_online(true);
    h.remote.script([CreateReply::Transient]);

    let before = Utc::now();
    let first = h.registry.sync_now().await.unwrap();
    assert_eq!(first.retried, 1);

    let item = h
        .registry
        .queue_item(&created.temporary_id)
        .unwrap()
        .unwrap();
    let at = item.next_attempt_at.unwrap();
    assert!(at >= before + chrono::Duration::seconds(60));
    assert_eq!(first.next_due, Some(at));

    let second = h.registry.sync_now().await.unwrap();
    assert_eq!(second.attempted, 0);
    assert_eq!(h.remote.requests().len(), 1);
}

#[tokio::test]
async fn test_local_failure_after_server_accept_requeues_item() {
    let store = Arc::new(FailingReconcileStore::new());
    let remote = Arc::new(ScriptedRemote::new());
    remote.script([
        CreateReply::Created("P-5".into()),
        CreateReply::Created("P-5".into()),
    ]);
    let registry = OfflineRegistry::new(
        store.clone(),
        remote.clone(),
        Arc::new(MemoryAuditSink::new()),
        fast_config(),
    )
    .unwrap();
    let created = registry.create_offline(asha_devi(), &phc_worker()).unwrap();
    registry.set_online(true);

    let first = registry.sync_now().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(first.synced, 0);

    let item = registry
        .queue_item(&created.temporary_id)
        .unwrap()
        .unwrap();
    assert_eq!(item.status, SyncStatus::Pending);
    assert_eq!(item.retry_count, 0);
    assert!(item.was_sent());
    assert!(item.last_error.unwrap().contains("disk I/O error"));
    assert_eq!(
        registry.get(&created.temporary_id).unwrap().unwrap().status,
        SyncStatus::Pending
    );

    let second = registry.sync_now().await.unwrap();
    assert_eq!(second.synced, 1);
    assert!(registry.get("P-5").unwrap().unwrap().is_synced());

    let requests = remote.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].idempotency_key, requests[1].idempotency_key);
    assert_eq!(remote.duplicate_checks(), 1);
}

#[tokio::test]
async fn test_interrupted_attempt_is_recovered_on_start() {
    let h = harness(fast_config());
    let created = h
        .registry
        .create_offline(asha_devi(), &phc_worker())
        .unwrap();

    // Simulate a crash mid-attempt.
    let mut item = h
        .store
        .get_queue_item_for_target(&created.temporary_id)
        .unwrap()
        .unwrap();
    let mut record = h.store.get_entity(&created.temporary_id).unwrap().unwrap();
    item.status = SyncStatus::Syncing;
    item.retry_count = 1;
    record.status = SyncStatus::Syncing;
    h.store
        .apply(WriteBatch::new().put_entity(record).put_queue_item(item))
        .unwrap();

    let audit = Arc::new(MemoryAuditSink::new());
    let restarted = OfflineRegistry::new(
        h.store.clone(),
        Arc::new(ScriptedRemote::new()),
        audit.clone(),
        fast_config(),
    )
    .unwrap();

    let item = restarted
        .queue_item(&created.temporary_id)
        .unwrap()
        .unwrap();
    assert_eq!(item.status, SyncStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert_eq!(
        restarted.get(&created.temporary_id).unwrap().unwrap().status,
        SyncStatus::Pending
    );
    assert_eq!(
        audit.actions_for(&created.temporary_id),
        vec![AuditAction::RecoveredInterrupted]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_loop_syncs_on_reconnect() {
    let h = harness(SyncConfig {
        poll_interval_ms: 3_600_000,
        ..fast_config()
    });
    let mut events = h.registry.subscribe();
    h.registry.start().unwrap();

    let created = h
        .registry
        .create_offline(asha_devi(), &phc_worker())
        .unwrap();
    h.remote.script([CreateReply::Created("P-31".into())]);

    // Give the loop's initial pass time to run while offline.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.remote.requests().is_empty());

    h.registry.set_online(true);
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("reconciled within timeout")
        .unwrap();

    assert_eq!(
        event,
        SyncEvent::Reconciled {
            temporary_id: created.temporary_id,
            server_id: "P-31".into(),
        }
    );
    h.registry.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_loop_retries_after_backoff() {
    let h = harness(SyncConfig {
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        poll_interval_ms: 3_600_000,
        ..fast_config()
    });
    let mut events = h.registry.subscribe();
    h.remote.script([CreateReply::Transient]);
    h.registry.set_online(true);
    h.registry.start().unwrap();

    let created = h
        .registry
        .create_offline(asha_devi(), &phc_worker())
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("reconciled within timeout")
        .unwrap();

    assert!(matches!(
        event,
        SyncEvent::Reconciled { ref temporary_id, .. } if *temporary_id == created.temporary_id
    ));
    assert_eq!(h.remote.requests().len(), 2);
}

#[tokio::test]
async fn test_queue_survives_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.db");

    let temp_id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let registry = OfflineRegistry::new(
            store,
            Arc::new(ScriptedRemote::new()),
            Arc::new(MemoryAuditSink::new()),
            fast_config(),
        )
        .unwrap();
        registry
            .create_offline(asha_devi(), &phc_worker())
            .unwrap()
            .temporary_id
    };

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let remote = Arc::new(ScriptedRemote::new());
    remote.script([CreateReply::Created("P-4821".into())]);
    let registry = OfflineRegistry::new(
        store.clone(),
        remote.clone(),
        Arc::new(MemoryAuditSink::new()),
        fast_config(),
    )
    .unwrap();

    let pending = registry.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, temp_id);

    let next = registry.create_offline(patient(1), &phc_worker()).unwrap();
    assert!(
        offline_registry_core::ids::timestamp_of(&next.temporary_id)
            > offline_registry_core::ids::timestamp_of(&temp_id)
    );

    registry.set_online(true);
    registry.sync_now().await.unwrap();
    drop(registry);

    let reopened = SqliteStore::open(&path).unwrap();
    let record = reopened.get_entity("P-4821").unwrap().unwrap();
    assert_eq!(record.status, SyncStatus::Synced);
    assert_eq!(record.temporary_alias.as_deref(), Some(temp_id.as_str()));
    assert!(reopened.get_entity(&temp_id).unwrap().is_none());
}

#[tokio::test]
async fn test_prune_synced_keeps_open_items() {
    let h = harness(fast_config());
    let synced = h
        .registry
        .create_offline(patient(0), &phc_worker())
        .unwrap();
    h.registry.set_online(true);
    h.registry.sync_now().await.unwrap();
    h.registry.set_online(false);
    h.registry
        .create_offline(patient(1), &phc_worker())
        .unwrap();

    assert_eq!(
        h.registry
            .prune_synced(chrono::Duration::hours(1))
            .unwrap(),
        0
    );
    assert_eq!(
        h.registry.prune_synced(chrono::Duration::zero()).unwrap(),
        1
    );

    let stats = h.registry.stats().unwrap();
    assert_eq!(stats.synced, 0);
    assert_eq!(stats.pending, 1);
    // The reconciled record itself stays cached.
    assert!(h.registry.get(&synced.temporary_id).unwrap().unwrap().is_synced());
}
