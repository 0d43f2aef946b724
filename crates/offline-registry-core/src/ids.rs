//! Temporary identifiers for records created offline.
//!
//! Format: `TEMP_<unix millis>_<ROLE TAG>`, e.g. `TEMP_1718000000123_PHC`.
//! The timestamp component strictly increases for sequential calls on one
//! device, even when the wall clock stalls or steps backwards.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::models::Actor;

/// Prefix shared by every temporary ID.
pub const TEMP_ID_PREFIX: &str = "TEMP_";

/// Device-local temporary ID generator.
#[derive(Debug, Default)]
pub struct TempIdGenerator {
    last: AtomicI64,
}

impl TempIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generator that never issues a timestamp at or below `last_issued`.
    pub fn resume_after(last_issued: i64) -> Self {
        Self {
            last: AtomicI64::new(last_issued),
        }
    }

    /// Issue the next temporary ID for `actor`.
    pub fn next(&self, actor: &Actor) -> String {
        let ts = self.next_timestamp();
        format!("{TEMP_ID_PREFIX}{ts}_{}", actor.role.tag())
    }

    /// Last timestamp handed out.
    pub fn last_issued(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }

    fn next_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(current + 1);
            match self
                .last
                .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }
}

/// True if `id` has the temporary ID shape.
pub fn is_temporary(id: &str) -> bool {
    timestamp_of(id).is_some()
}

/// Extract the timestamp component of a temporary ID.
pub fn timestamp_of(id: &str) -> Option<i64> {
    let rest = id.strip_prefix(TEMP_ID_PREFIX)?;
    let (ts, tag) = rest.split_once('_')?;
    if tag.is_empty() {
        return None;
    }
    ts.parse().ok()
}
