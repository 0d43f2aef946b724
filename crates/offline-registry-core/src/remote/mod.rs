//! Remote patient registry API.
//!
//! The processor talks to the server only through [`RemoteRegistry`]; the
//! HTTP adapter lives in [`http`].

mod http;

pub use http::HttpRemoteRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{MatchKeys, PatientFields};

/// Why the server refused a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectionKind {
    /// Server-side field validation failed
    Validation,
    /// The record conflicts with existing server state
    Conflict,
    /// The server already holds this patient
    Duplicate,
}

/// Remote call errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure, timeout or 5xx. Safe to retry.
    #[error("Transient remote error: {0}")]
    Transient(String),

    /// The server refused the request. Needs an operator edit.
    #[error("Rejected by server ({kind:?}): {message}")]
    Rejected { kind: RejectionKind, message: String },
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    pub fn rejected(kind: RejectionKind, message: impl Into<String>) -> Self {
        RemoteError::Rejected {
            kind,
            message: message.into(),
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Body of a remote create call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatePatientRequest {
    pub fields: PatientFields,
    pub match_keys: MatchKeys,
    /// Temporary ID the device knows the record by
    pub temporary_id: String,
    /// Same key for every attempt of the same snapshot
    pub idempotency_key: String,
}

/// Successful remote create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOnServer {
    pub server_id: String,
}

/// A patient the server already holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMatch {
    pub server_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Response of the remote duplicate check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDuplicateResponse {
    pub exists: bool,
    pub matched_entity: Option<RemoteMatch>,
}

/// Server-side patient registry.
#[async_trait]
pub trait RemoteRegistry: Send + Sync {
    /// Create a patient, returning the permanent server ID.
    async fn create_patient(&self, request: CreatePatientRequest) -> RemoteResult<CreatedOnServer>;

    /// Ask the server whether a patient with these keys already exists.
    async fn check_duplicate(&self, keys: MatchKeys) -> RemoteResult<RemoteDuplicateResponse>;
}
