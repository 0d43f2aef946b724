//! HTTP adapter for the remote registry.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{
    CreatePatientRequest, CreatedOnServer, RejectionKind, RemoteDuplicateResponse, RemoteError,
    RemoteRegistry, RemoteResult,
};
use crate::models::MatchKeys;

/// Registry client over JSON/HTTP.
///
/// Endpoints:
/// - `POST {base}/patients`
/// - `POST {base}/patients/duplicate-check`
#[derive(Debug, Clone)]
pub struct HttpRemoteRegistry {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

/// Error body returned by the server on 4xx.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpRemoteRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> RemoteResult<T> {
        let response = req.send().await.map_err(transport_error)?;
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| RemoteError::Transient(format!("Malformed response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[async_trait]
impl RemoteRegistry for HttpRemoteRegistry {
    async fn create_patient(&self, request: CreatePatientRequest) -> RemoteResult<CreatedOnServer> {
        let req = self
            .post("/patients")
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&request);
        self.send_json(req).await
    }

    async fn check_duplicate(&self, keys: MatchKeys) -> RemoteResult<RemoteDuplicateResponse> {
        let req = self.post("/patients/duplicate-check").json(&keys);
        self.send_json(req).await
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Transient("Request timed out".into())
    } else {
        RemoteError::Transient(format!("Network error: {e}"))
    }
}

/// Map a non-success status to a retryable or terminal error.
fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        });

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            RemoteError::rejected(RejectionKind::Validation, detail)
        }
        StatusCode::CONFLICT => RemoteError::rejected(RejectionKind::Conflict, detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(format!("{}: {detail}", status.as_u16()))
        }
        s if s.is_server_error() => RemoteError::Transient(format!("{}: {detail}", s.as_u16())),
        s => RemoteError::rejected(
            RejectionKind::Validation,
            format!("{}: {detail}", s.as_u16()),
        ),
    }
}
