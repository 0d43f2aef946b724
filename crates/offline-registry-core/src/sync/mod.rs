//! Sync queue processing and ID reconciliation.
//!
//! This module provides:
//! - Exponential backoff for transient failures
//! - The background queue processor
//! - Reconciliation of temporary IDs to server IDs

pub mod backoff;
pub mod processor;
pub mod reconcile;

pub use backoff::BackoffPolicy;
pub use processor::{AttemptOutcome, PassReport, SyncProcessor};
pub use reconcile::{ReconcileOutcome, Reconciler};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::store::StoreError;

/// Errors raised while processing the queue.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{temporary_id} is already reconciled to {existing}, refusing {requested}")]
    PermanentIdConflict {
        temporary_id: String,
        existing: String,
        requested: String,
    },

    #[error("No queued record for {0}")]
    NotFound(String),
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        SyncError::Store(StoreError::Poisoned(e.to_string()))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Notification published to foreground collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A temporary ID now maps to a permanent server ID
    Reconciled {
        temporary_id: String,
        server_id: String,
    },
    /// A record needs operator attention
    Failed {
        temporary_id: String,
        error: String,
    },
}

/// Per-item lock table.
///
/// Serializes read-modify-write transitions on one queue item (keyed by its
/// temporary ID) between the processor and foreground operations. Locks are
/// never held across a remote call.
#[derive(Debug, Default)]
pub struct ItemLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ItemLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with<T, E>(&self, key: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        let result = {
            let _guard = lock
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f()
        };

        // Drop the entry once nobody else is waiting on it.
        if let Ok(mut locks) = self.locks.lock() {
            if Arc::strong_count(&lock) == 2 {
                locks.remove(key);
            }
        }

        result
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_item_locks_serialize_same_key() {
        let locks = Arc::new(ItemLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    locks
                        .with::<_, StoreError>("TEMP_1_PHC", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(2));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_item_locks_pass_through_errors() {
        let locks = ItemLocks::new();
        let result: Result<(), SyncError> =
            locks.with("TEMP_1_PHC", || Err(SyncError::NotFound("TEMP_1_PHC".into())));
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }
}
