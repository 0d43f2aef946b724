//! Local duplicate detection against the entity cache and sync queue.

use std::sync::Arc;

use super::{DuplicateMatch, DuplicateSource, MatchReason};
use crate::models::{MatchKeys, PatientFields, PatientRecord, SyncQueueItem};
use crate::store::{LocalStore, StoreResult};

/// Normalize a name for comparison: trim, lowercase, collapse whitespace.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Checks a candidate against everything already on the device.
///
/// Matching runs in two passes. Phone first (exact, trimmed). Only when no
/// phone match exists does the normalized name + guardian name pass run, and
/// it requires a guardian name on both sides. Within a pass, server-confirmed
/// cache entries are checked before open queue items.
#[derive(Clone)]
pub struct LocalDuplicateDetector {
    store: Arc<dyn LocalStore>,
}

/// A candidate flattened into comparable keys.
struct NormalizedKeys {
    phone: String,
    name: String,
    guardian: Option<String>,
}

impl NormalizedKeys {
    fn from_keys(keys: &MatchKeys) -> Self {
        Self {
            phone: keys.phone.clone(),
            name: normalize_name(&keys.name),
            guardian: keys.guardian_name.as_deref().map(normalize_name),
        }
    }

    fn phone_matches(&self, other: &PatientFields) -> bool {
        !self.phone.is_empty() && other.phone.trim() == self.phone
    }

    fn name_matches(&self, other: &PatientFields) -> bool {
        let Some(guardian) = &self.guardian else {
            return false;
        };
        let other_guardian = match other.guardian_name.as_deref().map(normalize_name) {
            Some(g) if !g.is_empty() => g,
            _ => return false,
        };
        !self.name.is_empty() && normalize_name(&other.name) == self.name && other_guardian == *guardian
    }
}

impl LocalDuplicateDetector {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Check `candidate` for a local duplicate.
    ///
    /// `exclude_id` names a record to ignore (the record being edited on
    /// retry); it matches either the current id or the temporary id.
    pub fn check(
        &self,
        candidate: &PatientFields,
        exclude_id: Option<&str>,
    ) -> StoreResult<Option<DuplicateMatch>> {
        let wanted = NormalizedKeys::from_keys(&candidate.match_keys());

        let cached: Vec<PatientRecord> = self
            .store
            .list_entities()?
            .into_iter()
            .filter(|r| r.is_synced())
            .filter(|r| exclude_id.map(|id| !r.answers_to(id)).unwrap_or(true))
            .collect();

        let queued: Vec<SyncQueueItem> = self
            .store
            .list_queue_items()?
            .into_iter()
            .filter(SyncQueueItem::is_open_create)
            .filter(|i| exclude_id.map(|id| i.target_id != id).unwrap_or(true))
            .collect();

        let passes: [(MatchReason, fn(&NormalizedKeys, &PatientFields) -> bool); 2] = [
            (MatchReason::Phone, NormalizedKeys::phone_matches),
            (MatchReason::NameAndGuardian, NormalizedKeys::name_matches),
        ];

        for (reason, matches) in passes {
            if let Some(record) = cached.iter().find(|r| matches(&wanted, &r.fields)) {
                return Ok(Some(DuplicateMatch {
                    matched_id: record.id.clone(),
                    source: DuplicateSource::Cached,
                    reason,
                }));
            }
            if let Some(item) = queued.iter().find(|i| matches(&wanted, &i.payload)) {
                return Ok(Some(DuplicateMatch {
                    matched_id: item.target_id.clone(),
                    source: DuplicateSource::Queued,
                    reason,
                }));
            }
        }

        Ok(None)
    }
}
