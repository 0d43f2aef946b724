//! Background sync queue processor.
//!
//! Each queue item moves through
//! `Pending -> Syncing -> {Synced | Pending (retry) | Failed}`.
//! Items are dispatched in priority then FIFO order, at most one attempt per
//! item at a time, with up to `worker_limit` items in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{BackoffPolicy, ItemLocks, ReconcileOutcome, Reconciler, SyncError, SyncEvent, SyncResult};
use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::duplicate::{remote_duplicate, DuplicateMatch, RemoteCheck, RemoteDuplicateDetector};
use crate::models::{Actor, SyncQueueItem, SyncStatus};
use crate::remote::{CreatePatientRequest, RejectionKind, RemoteError, RemoteRegistry};
use crate::store::{LocalStore, WriteBatch};

/// Lower bound on the loop's sleep before a backoff deadline.
const MIN_BACKOFF_WAIT: Duration = Duration::from_millis(250);

/// What happened to one item during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Synced { server_id: String },
    RetryScheduled { retry_count: u32, at: DateTime<Utc> },
    Failed { error: String },
    /// The item changed state before the attempt began
    Skipped,
}

/// Summary of one processor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub attempted: usize,
    pub synced: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Earliest backoff deadline among pending items
    pub next_due: Option<DateTime<Utc>>,
}

impl PassReport {
    fn record(&mut self, outcome: &AttemptOutcome) {
        match outcome {
            AttemptOutcome::Synced { .. } => self.synced += 1,
            AttemptOutcome::RetryScheduled { .. } => self.retried += 1,
            AttemptOutcome::Failed { .. } => self.failed += 1,
            AttemptOutcome::Skipped => {
                self.skipped += 1;
                return;
            }
        }
        self.attempted += 1;
    }
}

/// Removes an item from the in-flight set when dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    fn claim(set: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let mut in_flight = set.lock().ok()?;
        if !in_flight.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            key: key.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.set.lock() {
            in_flight.remove(&self.key);
        }
    }
}

/// Drains the sync queue against the remote registry.
pub struct SyncProcessor {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteRegistry>,
    remote_check: RemoteDuplicateDetector,
    reconciler: Reconciler,
    connectivity: Arc<ConnectivityMonitor>,
    audit: Arc<dyn AuditSink>,
    locks: Arc<ItemLocks>,
    events: broadcast::Sender<SyncEvent>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    workers: Arc<Semaphore>,
    nudge: Notify,
    backoff: BackoffPolicy,
    config: SyncConfig,
}

impl SyncProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteRegistry>,
        connectivity: Arc<ConnectivityMonitor>,
        audit: Arc<dyn AuditSink>,
        locks: Arc<ItemLocks>,
        events: broadcast::Sender<SyncEvent>,
        config: SyncConfig,
    ) -> Self {
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            events.clone(),
            Arc::clone(&audit),
        );
        Self {
            remote_check: RemoteDuplicateDetector::new(Arc::clone(&remote), config.request_timeout()),
            workers: Arc::new(Semaphore::new(config.worker_limit())),
            backoff: BackoffPolicy::from_config(&config),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            nudge: Notify::new(),
            store,
            remote,
            reconciler,
            connectivity,
            audit,
            locks,
            events,
            config,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Wake the background loop for an early pass.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    /// Return items left in Syncing by an interrupted run to Pending.
    ///
    /// The interrupted attempt does not consume a retry.
    pub fn recover_interrupted(&self) -> SyncResult<usize> {
        let stuck: Vec<SyncQueueItem> = self
            .store
            .list_queue_items()?
            .into_iter()
            .filter(|i| i.status == SyncStatus::Syncing)
            .collect();

        let mut recovered = 0;
        for item in stuck {
            let target = item.target_id.clone();
            let changed = self.locks.with(&target, || -> SyncResult<bool> {
                let Some(mut item) = self.store.get_queue_item_for_target(&target)? else {
                    return Ok(false);
                };
                if item.status != SyncStatus::Syncing {
                    return Ok(false);
                }
                item.status = SyncStatus::Pending;
                item.updated_at = Utc::now();

                let mut batch = WriteBatch::new();
                if let Some(mut record) = self.store.get_entity(&target)? {
                    record.status = SyncStatus::Pending;
                    record.touch();
                    batch = batch.put_entity(record);
                }
                self.store.apply(batch.put_queue_item(item))?;
                Ok(true)
            })?;

            if changed {
                recovered += 1;
                warn!(temp_id = %target, "Recovered interrupted sync attempt");
                self.audit.record(AuditEvent::new(
                    AuditAction::RecoveredInterrupted,
                    &target,
                    serde_json::Value::Null,
                    &Actor::system(),
                ));
            }
        }
        Ok(recovered)
    }

    /// Run one pass over every due item.
    ///
    /// Does nothing while offline. Going offline mid-pass stops further
    /// dispatch; attempts already started run to completion or timeout.
    pub async fn run_pass(self: &Arc<Self>) -> SyncResult<PassReport> {
        let mut report = PassReport::default();

        if !self.connectivity.is_online() {
            debug!("Offline, skipping sync pass");
            report.next_due = self.next_due()?;
            return Ok(report);
        }

        let now = Utc::now();
        let due: Vec<SyncQueueItem> = self
            .store
            .list_queue_items()?
            .into_iter()
            .filter(|i| i.is_due(now))
            .collect();

        let mut tasks = JoinSet::new();
        for item in due {
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                break;
            };
            if !self.connectivity.is_online() {
                info!("Went offline, halting dispatch");
                break;
            }
            let Some(guard) = InFlightGuard::claim(&self.in_flight, &item.target_id) else {
                debug!(temp_id = %item.target_id, "Attempt already in flight");
                continue;
            };

            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                this.attempt(&item.target_id).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(&outcome),
                Ok(Err(e)) => error!("Sync attempt failed: {}", e),
                Err(e) => error!("Sync task panicked: {}", e),
            }
        }

        report.next_due = self.next_due()?;
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                retried = report.retried,
                failed = report.failed,
                "Sync pass complete"
            );
        }
        Ok(report)
    }

    /// Earliest time a pending item becomes due.
    pub fn next_due(&self) -> SyncResult<Option<DateTime<Utc>>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_queue_items()?
            .into_iter()
            .filter(|i| i.status == SyncStatus::Pending)
            .map(|i| i.next_attempt_at.unwrap_or(now))
            .min())
    }

    /// Spawn the background loop.
    ///
    /// A pass runs on every offline to online transition, on each poll tick,
    /// on nudges, and when the earliest backoff deadline passes.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut online = self.connectivity.subscribe();
            let mut ticker = tokio::time::interval(self.config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut next_due: Option<DateTime<Utc>> = None;

            loop {
                let wait = next_due.map(|at| {
                    (at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .max(MIN_BACKOFF_WAIT)
                });
                let backoff_elapsed = async {
                    match wait {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*online.borrow_and_update() {
                            continue;
                        }
                        info!("Back online, starting sync pass");
                    }
                    _ = ticker.tick() => {}
                    _ = self.nudge.notified() => {}
                    _ = backoff_elapsed => {}
                }

                match self.run_pass().await {
                    Ok(report) if self.connectivity.is_online() => next_due = report.next_due,
                    Ok(_) => next_due = None,
                    Err(e) => {
                        error!("Sync pass failed: {}", e);
                        next_due = None;
                    }
                }
            }
        })
    }

    /// One attempt for the item targeting `target_id`.
    async fn attempt(&self, target_id: &str) -> SyncResult<AttemptOutcome> {
        let Some(item) = self.begin(target_id)? else {
            return Ok(AttemptOutcome::Skipped);
        };
        let keys = item.payload.match_keys();

        // A snapshot already handed to the server may be held there; asking
        // again would report the record as its own duplicate. The
        // idempotency key covers that case instead.
        if item.was_sent() {
            debug!(temp_id = %target_id, "Snapshot already sent, skipping remote duplicate check");
        } else {
            match self.remote_check.check(&keys).await {
                RemoteCheck::Duplicate(matched) => {
                    let found = remote_duplicate(&matched, &keys);
                    let error = RemoteError::rejected(
                        RejectionKind::Duplicate,
                        format!("Patient already registered on server: {found}"),
                    );
                    return self.finish_failed(target_id, error, Some(found));
                }
                RemoteCheck::Skipped(reason) => {
                    debug!(temp_id = %target_id, %reason, "Remote duplicate check skipped");
                }
                RemoteCheck::Clear => {}
            }

            if let Err(e) = self.mark_sent(target_id, &item.payload_digest) {
                return self.release(target_id, e);
            }
        }

        let request = CreatePatientRequest {
            match_keys: keys,
            fields: item.payload.clone(),
            temporary_id: item.target_id.clone(),
            idempotency_key: item.payload_digest.clone(),
        };

        let timeout = self.config.request_timeout();
        let result = match tokio::time::timeout(timeout, self.remote.create_patient(request)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient(format!(
                "Request timed out after {} ms",
                timeout.as_millis()
            ))),
        };

        match result {
            Ok(created) => match self.reconciler.reconcile(target_id, &created.server_id) {
                Ok(outcome) => {
                    if let ReconcileOutcome::AlreadyReconciled(_) = outcome {
                        debug!(temp_id = %target_id, "Record was reconciled concurrently");
                    }
                    Ok(AttemptOutcome::Synced {
                        server_id: created.server_id,
                    })
                }
                Err(SyncError::Store(e)) => {
                    error!(
                        temp_id = %target_id,
                        server_id = %created.server_id,
                        error = %e,
                        "Server accepted record but local reconciliation failed"
                    );
                    self.release(target_id, SyncError::Store(e))
                }
                Err(e) => Err(e),
            },
            Err(e) => self.finish_failed(target_id, e, None),
        }
    }

    /// Record that the current snapshot is about to reach the server.
    fn mark_sent(&self, target_id: &str, digest: &str) -> SyncResult<()> {
        self.locks.with(target_id, || -> SyncResult<()> {
            let Some(mut item) = self.store.get_queue_item_for_target(target_id)? else {
                return Ok(());
            };
            if item.status != SyncStatus::Syncing || item.sent_digest.as_deref() == Some(digest) {
                return Ok(());
            }
            item.sent_digest = Some(digest.to_string());
            item.updated_at = Utc::now();
            self.store.apply(WriteBatch::new().put_queue_item(item))?;
            Ok(())
        })
    }

    /// Return an item stuck in Syncing by a local failure to Pending.
    ///
    /// Local failures do not consume a retry. The next attempt resends the
    /// same snapshot under the same idempotency key. If even this write
    /// fails, the original error is returned and start-up recovery picks
    /// the item up.
    fn release(&self, target_id: &str, cause: SyncError) -> SyncResult<AttemptOutcome> {
        let released = self.locks.with(target_id, || -> SyncResult<Option<AttemptOutcome>> {
            let Some(mut item) = self.store.get_queue_item_for_target(target_id)? else {
                return Ok(None);
            };
            if item.status != SyncStatus::Syncing {
                return Ok(None);
            }
            let now = Utc::now();
            let delay = self.backoff.delay_for(item.retry_count.max(1));
            let at = now
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::milliseconds(self.config.max_delay_ms as i64));
            item.status = SyncStatus::Pending;
            item.next_attempt_at = Some(at);
            item.last_error = Some(cause.to_string());
            item.updated_at = now;

            let mut batch = WriteBatch::new();
            if let Some(mut record) = self.store.get_entity(target_id)? {
                record.status = SyncStatus::Pending;
                record.touch();
                batch = batch.put_entity(record);
            }
            self.store.apply(batch.put_queue_item(item.clone()))?;
            Ok(Some(AttemptOutcome::RetryScheduled {
                retry_count: item.retry_count,
                at,
            }))
        });

        match released {
            Ok(Some(outcome)) => {
                warn!(temp_id = %target_id, error = %cause, "Local failure during sync, item requeued");
                Ok(outcome)
            }
            Ok(None) => Err(cause),
            Err(e) => {
                error!(temp_id = %target_id, error = %e, "Could not requeue item");
                Err(cause)
            }
        }
    }

    /// Move a due item to Syncing. Returns `None` if it is no longer due.
    fn begin(&self, target_id: &str) -> SyncResult<Option<SyncQueueItem>> {
        let item = self.locks.with(target_id, || -> SyncResult<Option<SyncQueueItem>> {
            let Some(mut item) = self.store.get_queue_item_for_target(target_id)? else {
                return Ok(None);
            };
            let now = Utc::now();
            if !item.is_due(now) {
                return Ok(None);
            }
            let mut record = self
                .store
                .get_entity(target_id)?
                .ok_or_else(|| SyncError::NotFound(target_id.to_string()))?;

            item.status = SyncStatus::Syncing;
            item.updated_at = now;
            record.status = SyncStatus::Syncing;
            record.sync.attempts += 1;
            record.sync.last_attempt_at = Some(now.to_rfc3339());
            record.touch();

            self.store
                .apply(WriteBatch::new().put_entity(record).put_queue_item(item.clone()))?;
            Ok(Some(item))
        })?;

        if let Some(item) = &item {
            debug!(
                queue_id = %item.id,
                temp_id = %target_id,
                retry_count = item.retry_count,
                "Sync attempt started"
            );
            self.audit.record(AuditEvent::new(
                AuditAction::SyncStarted,
                target_id,
                serde_json::json!({ "retry_count": item.retry_count }),
                &Actor::system(),
            ));
        }
        Ok(item)
    }

    /// Record a failed attempt: schedule a retry or mark the item Failed.
    fn finish_failed(
        &self,
        target_id: &str,
        error: RemoteError,
        duplicate: Option<DuplicateMatch>,
    ) -> SyncResult<AttemptOutcome> {
        let message = error.to_string();
        let retryable = error.is_retryable();
        let outcome = self.locks.with(target_id, || -> SyncResult<AttemptOutcome> {
            let Some(mut item) = self.store.get_queue_item_for_target(target_id)? else {
                return Ok(AttemptOutcome::Skipped);
            };
            if item.status != SyncStatus::Syncing {
                return Ok(AttemptOutcome::Skipped);
            }
            let mut record = self
                .store
                .get_entity(target_id)?
                .ok_or_else(|| SyncError::NotFound(target_id.to_string()))?;

            let now = Utc::now();
            item.retry_count = (item.retry_count + 1).min(item.max_retries);
            item.last_error = Some(message.clone());
            item.updated_at = now;
            record.sync.last_error = Some(message.clone());
            record.touch();

            let outcome = if retryable && item.retry_count < item.max_retries {
                let delay = self.backoff.delay_for(item.retry_count);
                let at = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::milliseconds(self.config.max_delay_ms as i64));
                item.status = SyncStatus::Pending;
                item.next_attempt_at = Some(at);
                record.status = SyncStatus::Pending;
                AttemptOutcome::RetryScheduled {
                    retry_count: item.retry_count,
                    at,
                }
            } else {
                item.status = SyncStatus::Failed;
                item.next_attempt_at = None;
                record.status = SyncStatus::Failed;
                AttemptOutcome::Failed {
                    error: message.clone(),
                }
            };

            self.store
                .apply(WriteBatch::new().put_entity(record).put_queue_item(item))?;
            Ok(outcome)
        })?;

        match &outcome {
            AttemptOutcome::RetryScheduled { retry_count, at } => {
                warn!(
                    temp_id = %target_id,
                    retry_count,
                    next_attempt_at = %at,
                    error = %message,
                    "Sync attempt failed, retry scheduled"
                );
                self.audit.record(
                    AuditEvent::new(
                        AuditAction::SyncRetryScheduled,
                        target_id,
                        serde_json::json!({ "retry_count": retry_count, "next_attempt_at": at }),
                        &Actor::system(),
                    )
                    .with_note(message.clone()),
                );
            }
            AttemptOutcome::Failed { error } => {
                error!(temp_id = %target_id, error = %error, "Sync failed, operator action required");
                self.audit.record(
                    AuditEvent::new(
                        AuditAction::SyncFailed,
                        target_id,
                        serde_json::json!({
                            "retries_exhausted": retryable,
                            "duplicate": duplicate,
                        }),
                        &Actor::system(),
                    )
                    .with_note(error.clone()),
                );
                let _ = self.events.send(SyncEvent::Failed {
                    temporary_id: target_id.to_string(),
                    error: error.clone(),
                });
            }
            _ => {}
        }

        Ok(outcome)
    }
}
