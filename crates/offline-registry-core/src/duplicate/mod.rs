//! Duplicate detection.
//!
//! - [`local`]: checks the entity cache and sync queue before a record is
//!   enqueued. Fails closed: a store error blocks creation.
//! - [`remote`]: asks the server during a sync attempt. Fails open: any
//!   error or timeout lets the attempt proceed.

pub mod local;
pub mod remote;

pub use local::LocalDuplicateDetector;
pub use remote::{remote_duplicate, RemoteCheck, RemoteDuplicateDetector};

use serde::{Deserialize, Serialize};

/// Where a duplicate was found.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DuplicateSource {
    /// A server-confirmed record in the entity cache
    Cached,
    /// A record still waiting in the sync queue
    Queued,
    /// The server reported an existing patient
    Remote,
}

impl DuplicateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateSource::Cached => "cached",
            DuplicateSource::Queued => "queued",
            DuplicateSource::Remote => "remote",
        }
    }
}

/// Which keys matched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MatchReason {
    Phone,
    NameAndGuardian,
}

/// A record that the candidate duplicates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateMatch {
    /// ID of the existing record (server ID or temporary ID)
    pub matched_id: String,
    pub source: DuplicateSource,
    pub reason: MatchReason,
}

impl std::fmt::Display for DuplicateMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self.reason {
            MatchReason::Phone => "same phone number",
            MatchReason::NameAndGuardian => "same name and guardian",
        };
        write!(
            f,
            "duplicate of {} ({}, {})",
            self.matched_id,
            self.source.as_str(),
            reason
        )
    }
}
