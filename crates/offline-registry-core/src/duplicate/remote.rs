//! Remote duplicate check, performed during a sync attempt.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{DuplicateMatch, DuplicateSource, MatchReason};
use crate::models::MatchKeys;
use crate::remote::{RemoteMatch, RemoteRegistry};

/// Outcome of asking the server about a candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCheck {
    /// The server already holds this patient
    Duplicate(RemoteMatch),
    /// The server knows no such patient
    Clear,
    /// The check could not be completed; the attempt proceeds
    Skipped(String),
}

impl RemoteCheck {
    pub fn was_skipped(&self) -> bool {
        matches!(self, RemoteCheck::Skipped(_))
    }
}

/// Describe a server-side match in the same terms as a local one.
///
/// The server does not say which keys matched. A differing phone on the
/// match means it was found by name and guardian.
pub fn remote_duplicate(matched: &RemoteMatch, keys: &MatchKeys) -> DuplicateMatch {
    let reason = match matched.phone.as_deref().map(str::trim) {
        Some(phone) if phone != keys.phone => MatchReason::NameAndGuardian,
        _ => MatchReason::Phone,
    };
    DuplicateMatch {
        matched_id: matched.server_id.clone(),
        source: DuplicateSource::Remote,
        reason,
    }
}

/// Fail-open wrapper around [`RemoteRegistry::check_duplicate`].
#[derive(Clone)]
pub struct RemoteDuplicateDetector {
    remote: Arc<dyn RemoteRegistry>,
    timeout: Duration,
}

impl RemoteDuplicateDetector {
    pub fn new(remote: Arc<dyn RemoteRegistry>, timeout: Duration) -> Self {
        Self { remote, timeout }
    }

    pub async fn check(&self, keys: &MatchKeys) -> RemoteCheck {
        match tokio::time::timeout(self.timeout, self.remote.check_duplicate(keys.clone())).await {
            Ok(Ok(response)) if response.exists => match response.matched_entity {
                Some(matched) => RemoteCheck::Duplicate(matched),
                None => {
                    warn!(phone = %keys.phone, "Server reported a duplicate without a match");
                    RemoteCheck::Skipped("duplicate reported without matched entity".into())
                }
            },
            Ok(Ok(_)) => RemoteCheck::Clear,
            Ok(Err(e)) => {
                warn!(error = %e, "Remote duplicate check failed, continuing");
                RemoteCheck::Skipped(e.to_string())
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Remote duplicate check timed out, continuing");
                RemoteCheck::Skipped("timed out".into())
            }
        }
    }
}
