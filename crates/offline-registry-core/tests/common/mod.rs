//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use offline_registry_core::connectivity::ConnectivityMonitor;
use offline_registry_core::models::{Actor, ActorRole, MatchKeys, PatientFields};
use offline_registry_core::remote::{
    CreatePatientRequest, CreatedOnServer, RejectionKind, RemoteDuplicateResponse, RemoteError,
    RemoteMatch, RemoteRegistry, RemoteResult,
};
use offline_registry_core::{MemoryAuditSink, MemoryStore, OfflineRegistry, SyncConfig};

/// Scripted reply to a create call.
#[derive(Debug, Clone)]
pub enum CreateReply {
    Created(String),
    Transient,
    Rejected(RejectionKind),
    /// Never answers; the caller's timeout fires
    Hang,
}

/// Scripted reply to a duplicate check.
#[derive(Debug, Clone)]
pub enum DuplicateReply {
    Clear,
    Exists(String),
    Unavailable,
}

/// Remote registry driven by a script.
///
/// Create calls pop replies from the script; once it runs dry every create
/// succeeds with a fresh `P-<n>` id.
pub struct ScriptedRemote {
    creates: Mutex<VecDeque<CreateReply>>,
    duplicate: Mutex<DuplicateReply>,
    requests: Mutex<Vec<CreatePatientRequest>>,
    duplicate_checks: AtomicUsize,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_id: AtomicUsize,
    disconnect_after_create: Mutex<Option<Arc<ConnectivityMonitor>>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self {
            creates: Mutex::new(VecDeque::new()),
            duplicate: Mutex::new(DuplicateReply::Clear),
            requests: Mutex::new(Vec::new()),
            duplicate_checks: AtomicUsize::new(0),
            latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1000),
            disconnect_after_create: Mutex::new(None),
        }
    }

    pub fn script(&self, replies: impl IntoIterator<Item = CreateReply>) {
        self.creates.lock().unwrap().extend(replies);
    }

    pub fn set_duplicate(&self, reply: DuplicateReply) {
        *self.duplicate.lock().unwrap() = reply;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Report the device offline as soon as the first create completes.
    pub fn disconnect_after_create(&self, monitor: Arc<ConnectivityMonitor>) {
        *self.disconnect_after_create.lock().unwrap() = Some(monitor);
    }

    pub fn requests(&self) -> Vec<CreatePatientRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requested_ids(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| r.temporary_id)
            .collect()
    }

    pub fn duplicate_checks(&self) -> usize {
        self.duplicate_checks.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteRegistry for ScriptedRemote {
    async fn create_patient(&self, request: CreatePatientRequest) -> RemoteResult<CreatedOnServer> {
        self.requests.lock().unwrap().push(request);
        let reply = self.creates.lock().unwrap().pop_front();
        let latency = *self.latency.lock().unwrap();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(monitor) = self.disconnect_after_create.lock().unwrap().take() {
            monitor.set_online(false);
        }

        match reply {
            Some(CreateReply::Created(server_id)) => Ok(CreatedOnServer { server_id }),
            Some(CreateReply::Transient) => Err(RemoteError::Transient("503: Service Unavailable".into())),
            Some(CreateReply::Rejected(kind)) => {
                Err(RemoteError::rejected(kind, "phone number rejected by server"))
            }
            Some(CreateReply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(RemoteError::Transient("hung".into()))
            }
            None => Ok(CreatedOnServer {
                server_id: format!("P-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            }),
        }
    }

    async fn check_duplicate(&self, _keys: MatchKeys) -> RemoteResult<RemoteDuplicateResponse> {
        self.duplicate_checks.fetch_add(1, Ordering::SeqCst);
        let reply = self.duplicate.lock().unwrap().clone();
        match reply {
            DuplicateReply::Clear => Ok(RemoteDuplicateResponse {
                exists: false,
                matched_entity: None,
            }),
            DuplicateReply::Exists(server_id) => Ok(RemoteDuplicateResponse {
                exists: true,
                matched_entity: Some(RemoteMatch {
                    server_id,
                    name: None,
                    phone: None,
                }),
            }),
            DuplicateReply::Unavailable => Err(RemoteError::Transient("connection reset".into())),
        }
    }
}

/// Remote registry that keeps what it creates.
///
/// Creates are idempotent on the request key, and duplicate checks match on
/// phone against stored patients. The first create can be made to commit
/// without replying.
pub struct RememberingServer {
    patients: Mutex<Vec<(String, MatchKeys)>>,
    by_key: Mutex<HashMap<String, String>>,
    drop_next_reply: AtomicBool,
    duplicate_checks: AtomicUsize,
    next_id: AtomicUsize,
}

impl RememberingServer {
    pub fn new() -> Self {
        Self {
            patients: Mutex::new(Vec::new()),
            by_key: Mutex::new(HashMap::new()),
            drop_next_reply: AtomicBool::new(false),
            duplicate_checks: AtomicUsize::new(0),
            next_id: AtomicUsize::new(4821),
        }
    }

    /// Store the next new patient, then never answer.
    pub fn drop_next_reply(&self) {
        self.drop_next_reply.store(true, Ordering::SeqCst);
    }

    /// A patient registered on the server by someone else.
    pub fn seed(&self, server_id: &str, fields: &PatientFields) {
        self.patients
            .lock()
            .unwrap()
            .push((server_id.to_string(), fields.match_keys()));
    }

    pub fn patient_count(&self) -> usize {
        self.patients.lock().unwrap().len()
    }

    pub fn duplicate_checks(&self) -> usize {
        self.duplicate_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteRegistry for RememberingServer {
    async fn create_patient(&self, request: CreatePatientRequest) -> RemoteResult<CreatedOnServer> {
        if let Some(server_id) = self.by_key.lock().unwrap().get(&request.idempotency_key) {
            return Ok(CreatedOnServer {
                server_id: server_id.clone(),
            });
        }

        let server_id = format!("P-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.by_key
            .lock()
            .unwrap()
            .insert(request.idempotency_key.clone(), server_id.clone());
        self.patients
            .lock()
            .unwrap()
            .push((server_id.clone(), request.match_keys));

        if self.drop_next_reply.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(CreatedOnServer { server_id })
    }

    async fn check_duplicate(&self, keys: MatchKeys) -> RemoteResult<RemoteDuplicateResponse> {
        self.duplicate_checks.fetch_add(1, Ordering::SeqCst);
        let matched = self
            .patients
            .lock()
            .unwrap()
            .iter()
            .find(|(_, stored)| stored.phone == keys.phone)
            .map(|(server_id, stored)| RemoteMatch {
                server_id: server_id.clone(),
                name: Some(stored.name.clone()),
                phone: Some(stored.phone.clone()),
            });
        Ok(RemoteDuplicateResponse {
            exists: matched.is_some(),
            matched_entity: matched,
        })
    }
}

/// Config with no backoff delay and a short request timeout.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        max_retries: 3,
        base_delay_ms: 0,
        max_delay_ms: 0,
        request_timeout_ms: 200,
        worker_limit: 4,
        poll_interval_ms: 60_000,
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub remote: Arc<ScriptedRemote>,
    pub audit: Arc<MemoryAuditSink>,
    pub registry: OfflineRegistry,
}

pub fn harness(config: SyncConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(ScriptedRemote::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let registry = OfflineRegistry::new(store.clone(), remote.clone(), audit.clone(), config)
        .expect("registry");
    Harness {
        store,
        remote,
        audit,
        registry,
    }
}

pub fn phc_worker() -> Actor {
    Actor::new("worker-17", ActorRole::Phc)
}

pub fn asha_devi() -> PatientFields {
    PatientFields {
        age: Some(34),
        gender: Some("Female".into()),
        diagnosis: Some("Focal epilepsy".into()),
        ..PatientFields::new("Asha Devi", "9876543210", "PHC-1")
    }
}

/// A valid patient distinguished by `n`.
pub fn patient(n: u32) -> PatientFields {
    let names = ["Meena", "Kavita", "Sunita", "Lakshmi", "Pooja", "Rekha", "Anita", "Geeta"];
    PatientFields {
        age: Some(20 + n % 50),
        ..PatientFields::new(
            format!("{} Kumari", names[n as usize % names.len()]),
            format!("9{:09}", 100_000 + n),
            "PHC-1",
        )
    }
}
