#![forbid(unsafe_code)]

use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::thread_rng;
use signup_contracts::registration::RegistrationRecord;
use signup_contracts::MonotonicTimeNs;
use signup_engines::admin_auth::{AdminAuthConfig, AdminAuthRuntime, AuthDecision};
use signup_engines::capacity::CapacitySnapshot;
use signup_engines::password::verify_password;
use signup_os::gate::{bootstrap_admin_password_from_env, GateConfigRuntime};
use signup_os::mirror_sync::{
    mirror_sync_max_attempts_from_env, requeue_dead_letter_jobs, snapshot_queue_metrics,
    MirrorBatchSender, MirrorSenderRuntime, MirrorSyncQueueMetrics, MirrorSyncWorker,
    MirrorSyncWorkerPassMetrics,
};
use signup_os::registration::{
    local_registered_at_now, RegistrationRuntime, SignupFlowConfig, SignupForm, SubmitOutcome,
};
use signup_os::SignupError;
use signup_storage::gate_config::GateConfigFile;
use signup_storage::repo::RegistrationRepo;
use signup_storage::{data_dir_from_env, SignupStore, StorageError, StorePaths};
use thiserror::Error;
use tracing::{error, info, warn};

pub const ADMIN_PASSWORD_HEADER: &str = "x-signup-admin-password";
pub const MIRROR_WORKER_ID: &str = "signup_http_worker";
pub const MIRROR_MANUAL_WORKER_ID: &str = "signup_http_manual";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Validation(String),
    #[error("admin password required")]
    MissingCredentials,
    #[error("admin password rejected ({remaining_attempts} attempts left)")]
    Unauthorized { remaining_attempts: u16 },
    #[error("too many failed attempts, retry in {retry_after_ms} ms")]
    LockedOut { retry_after_ms: u32 },
    #[error("misconfigured: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdapterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::MissingCredentials | Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::LockedOut { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            Self::Validation(_) => "INVALID",
            Self::MissingCredentials | Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::LockedOut { .. } => "LOCKED_OUT",
            Self::Config(_) => "MISCONFIGURED",
            Self::Internal(_) => "ERROR",
        }
    }

    fn lock_poisoned(what: &str) -> Self {
        Self::Internal(format!("{what} lock poisoned"))
    }
}

impl From<SignupError> for AdapterError {
    fn from(err: SignupError) -> Self {
        if err.is_validation() {
            return Self::Validation(err.to_string());
        }
        error!(error = %err, "signup operation failed");
        Self::Internal(err.to_string())
    }
}

impl From<StorageError> for AdapterError {
    fn from(err: StorageError) -> Self {
        SignupError::from(err).into()
    }
}

impl IntoResponse for AdapterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorResponse {
            status: "error".to_string(),
            outcome: self.outcome().to_string(),
            reason: self.to_string(),
        });
        let mut response = (status, body).into_response();
        if let Self::LockedOut { retry_after_ms } = self {
            let seconds = retry_after_ms.div_ceil(1_000).max(1);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub outcome: String,
    pub reason: String,
}

/// Registration as returned over HTTP, with field names independent of the CSV header.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RegistrationView {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub serial: String,
    pub registered_at: String,
}

impl From<RegistrationRecord> for RegistrationView {
    fn from(r: RegistrationRecord) -> Self {
        Self {
            name: r.name,
            email: r.email,
            phone: r.phone,
            serial: r.serial,
            registered_at: r.registered_at,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SubmitRegistrationRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubmitRegistrationResponse {
    pub status: String,
    pub outcome: String,
    pub message: String,
    pub registration: Option<RegistrationView>,
    pub count: usize,
    pub limit: u16,
}

impl SubmitRegistrationResponse {
    pub fn is_full(&self) -> bool {
        self.outcome == "FULL"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusResponse {
    pub event_title: String,
    pub count: usize,
    pub limit: u16,
    pub remaining: usize,
    pub is_full: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LookupResponse {
    pub email: String,
    pub registrations: Vec<RegistrationView>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdminRegistrationsResponse {
    pub count: usize,
    pub limit: u16,
    pub registrations: Vec<RegistrationView>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct UpdateSettingsRequest {
    pub limit: u32,
    #[serde(default)]
    pub new_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdminActionResponse {
    pub status: String,
    pub outcome: String,
    pub limit: u16,
    pub count: usize,
    pub removed: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct AdapterSyncWorkerCounters {
    pub pass_count: u64,
    pub dequeued_total: u64,
    pub acked_total: u64,
    pub retry_scheduled_total: u64,
    pub dead_lettered_total: u64,
    pub last_pass_at_ns: Option<u64>,
    pub last_dequeued_count: u16,
    pub last_acked_count: u16,
    pub last_retry_scheduled_count: u16,
    pub last_dead_lettered_count: u16,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct AdapterSyncQueueCounters {
    pub queued_count: u32,
    pub in_flight_count: u32,
    pub acked_count: u32,
    pub dead_letter_count: u32,
    pub replay_due_count: u32,
}

impl From<MirrorSyncQueueMetrics> for AdapterSyncQueueCounters {
    fn from(m: MirrorSyncQueueMetrics) -> Self {
        Self {
            queued_count: m.queued_count,
            in_flight_count: m.in_flight_count,
            acked_count: m.acked_count,
            dead_letter_count: m.dead_letter_count,
            replay_due_count: m.replay_due_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct AdapterSyncHealth {
    pub mirror_mode: String,
    pub worker: AdapterSyncWorkerCounters,
    pub queue: AdapterSyncQueueCounters,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub registrations: usize,
    pub sync: AdapterSyncHealth,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MirrorSyncPassResponse {
    pub status: String,
    pub dequeued_count: u16,
    pub acked_count: u16,
    pub retry_scheduled_count: u16,
    pub dead_lettered_count: u16,
    pub queue: AdapterSyncQueueCounters,
}

impl From<MirrorSyncWorkerPassMetrics> for MirrorSyncPassResponse {
    fn from(m: MirrorSyncWorkerPassMetrics) -> Self {
        Self {
            status: "ok".to_string(),
            dequeued_count: m.dequeued_count,
            acked_count: m.acked_count,
            retry_scheduled_count: m.retry_scheduled_count,
            dead_lettered_count: m.dead_lettered_count,
            queue: m.queue_after.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MirrorRequeueResponse {
    pub status: String,
    pub requeued_count: usize,
    pub queue: AdapterSyncQueueCounters,
}

/// Everything needed to open a runtime; `from_env` is the production source.
#[derive(Debug, Clone)]
pub struct SignupRuntimeConfig {
    pub paths: StorePaths,
    pub flow: SignupFlowConfig,
    pub sender: MirrorSenderRuntime,
    pub mirror_max_attempts: u16,
    pub admin_auth: AdminAuthConfig,
}

impl SignupRuntimeConfig {
    pub fn from_env() -> Result<Self, AdapterError> {
        let sender = mirror_sender_from_lookup(|key| std::env::var(key).ok())?;
        Ok(Self {
            paths: StorePaths::in_dir(data_dir_from_env()),
            flow: SignupFlowConfig::from_env(),
            sender,
            mirror_max_attempts: mirror_sync_max_attempts_from_env(),
            admin_auth: AdminAuthConfig::mvp_v1(),
        })
    }
}

/// Mirror sender described by `SIGNUP_MIRROR_*` in `lookup`. A half-configured
/// target is an operator error, not a request error.
pub fn mirror_sender_from_lookup<F>(lookup: F) -> Result<MirrorSenderRuntime, AdapterError>
where
    F: Fn(&str) -> Option<String>,
{
    MirrorSenderRuntime::from_lookup_or_loopback(lookup)
        .map_err(|err| AdapterError::Config(format!("mirror target: {err}")))
}

/// Admin password carried in [`ADMIN_PASSWORD_HEADER`]. Header values that are
/// not visible ASCII read as absent.
pub fn admin_password_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(ADMIN_PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok())
}

/// Shared state behind the HTTP surface. Cloning shares the same store.
///
/// Lock order: `gate` is never held while taking `store`. No store or gate
/// lock is held across a mirror push or a password hash.
#[derive(Debug, Clone)]
pub struct SignupRuntime {
    store: Arc<Mutex<SignupStore>>,
    gate: Arc<Mutex<GateConfigRuntime>>,
    auth: Arc<Mutex<AdminAuthRuntime>>,
    registration: RegistrationRuntime,
    mirror: Arc<MirrorSyncWorker>,
    sync_worker_counters: Arc<Mutex<AdapterSyncWorkerCounters>>,
}

impl SignupRuntime {
    pub fn open(
        config: SignupRuntimeConfig,
        bootstrap_password: impl FnOnce() -> String,
    ) -> Result<Self, AdapterError> {
        for path in [
            &config.paths.registrations,
            &config.paths.gate_config,
            &config.paths.mirror_outbox,
        ] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|err| {
                    AdapterError::Internal(format!(
                        "failed to create data directory '{}': {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        let store = SignupStore::open(&config.paths)?;
        let gate = GateConfigRuntime::load_or_init(
            GateConfigFile::new(config.paths.gate_config.clone()),
            bootstrap_password,
        )?;
        info!(
            registrations = store.registration_count(),
            limit = gate.capacity_limit().get(),
            serial_scheme = config.flow.serial_scheme.as_str(),
            mirror_mode = config.sender.mode(),
            mirror_lease_ms = config.sender.lease_ms(),
            "signup runtime opened"
        );
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
            gate: Arc::new(Mutex::new(gate)),
            auth: Arc::new(Mutex::new(AdminAuthRuntime::new(config.admin_auth))),
            registration: RegistrationRuntime::new(config.flow),
            mirror: Arc::new(MirrorSyncWorker::new(config.sender, config.mirror_max_attempts)),
            sync_worker_counters: Arc::new(Mutex::new(AdapterSyncWorkerCounters::default())),
        })
    }

    pub fn default_from_env() -> Result<Self, AdapterError> {
        Self::open(
            SignupRuntimeConfig::from_env()?,
            bootstrap_admin_password_from_env,
        )
    }

    pub fn event_title(&self) -> &str {
        &self.registration.config().event_title
    }

    pub fn status(&self) -> Result<StatusResponse, AdapterError> {
        let snapshot = self.capacity_snapshot()?;
        Ok(StatusResponse {
            event_title: self.event_title().to_string(),
            count: snapshot.count,
            limit: snapshot.limit,
            remaining: snapshot.remaining,
            is_full: snapshot.is_full,
        })
    }

    pub fn submit_registration(
        &self,
        request: SubmitRegistrationRequest,
        now_ns: Option<u64>,
    ) -> Result<SubmitRegistrationResponse, AdapterError> {
        let form = SignupForm {
            name: request.name,
            email: request.email,
            phone: request.phone,
        };
        let now = now_from(now_ns);
        let limit = self.lock_gate()?.capacity_limit();
        let mut store = self.lock_store()?;
        let outcome = self
            .registration
            .submit(
                &mut store,
                limit,
                form,
                now,
                local_registered_at_now(),
                &mut thread_rng(),
            )
            .map_err(|err| match err {
                SignupError::Validation(v) => {
                    AdapterError::Validation(format!("請填寫完整資料 ({v})"))
                }
                other => other.into(),
            })?;
        let count = store.registration_count();
        drop(store);
        Ok(match outcome {
            SubmitOutcome::Accepted(record) => SubmitRegistrationResponse {
                status: "ok".to_string(),
                outcome: "ACCEPTED".to_string(),
                message: format!("報名成功！您的序號是：{}", record.serial),
                registration: Some(record.into()),
                count,
                limit: limit.get(),
            },
            SubmitOutcome::Full { count, limit } => SubmitRegistrationResponse {
                status: "ok".to_string(),
                outcome: "FULL".to_string(),
                message: "報名已額滿！".to_string(),
                registration: None,
                count,
                limit,
            },
        })
    }

    pub fn lookup(&self, email: &str) -> Result<LookupResponse, AdapterError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(AdapterError::Validation("email is required".to_string()));
        }
        let store = self.lock_store()?;
        let registrations = self
            .registration
            .lookup(&store, email)
            .into_iter()
            .map(RegistrationView::from)
            .collect();
        Ok(LookupResponse {
            email: email.to_string(),
            registrations,
        })
    }

    /// Checks the admin password for `client_key` through the failed-attempt
    /// limiter. The hash is verified with no lock held; this call blocks for
    /// the length of one password hash.
    pub fn authorize_admin(
        &self,
        client_key: &str,
        password: Option<&str>,
        now_ns: Option<u64>,
    ) -> Result<(), AdapterError> {
        let Some(password) = password.filter(|p| !p.is_empty()) else {
            return Err(AdapterError::MissingCredentials);
        };
        let now = now_from(now_ns);
        let admitted = self.lock_auth()?.admit(client_key, now);
        let decision = match admitted {
            Err(locked) => locked,
            Ok(()) => {
                let stored = self.lock_gate()?.admin_password_hash();
                let verified = verify_password(password, &stored);
                self.lock_auth()?.record(client_key, now, verified)
            }
        };
        match decision {
            AuthDecision::Granted => Ok(()),
            AuthDecision::Denied { remaining_attempts } => {
                warn!(client = client_key, remaining_attempts, "admin password rejected");
                Err(AdapterError::Unauthorized { remaining_attempts })
            }
            AuthDecision::LockedOut { retry_after_ms } => {
                warn!(client = client_key, retry_after_ms, "admin login locked out");
                Err(AdapterError::LockedOut { retry_after_ms })
            }
        }
    }

    pub fn admin_registrations(&self) -> Result<AdminRegistrationsResponse, AdapterError> {
        let limit = self.lock_gate()?.capacity_limit().get();
        let store = self.lock_store()?;
        let registrations: Vec<RegistrationView> = store
            .registration_rows()
            .iter()
            .cloned()
            .map(RegistrationView::from)
            .collect();
        Ok(AdminRegistrationsResponse {
            count: registrations.len(),
            limit,
            registrations,
        })
    }

    pub fn export_csv(&self) -> Result<Vec<u8>, AdapterError> {
        Ok(self.lock_store()?.registration_csv_bytes()?)
    }

    pub fn update_settings(
        &self,
        request: UpdateSettingsRequest,
    ) -> Result<AdminActionResponse, AdapterError> {
        let limit = self
            .lock_gate()?
            .update_settings(request.limit, request.new_password.as_deref())?
            .capacity_limit;
        self.admin_action("SETTINGS_UPDATED", limit.get(), None)
    }

    pub fn clear_all(&self, now_ns: Option<u64>) -> Result<AdminActionResponse, AdapterError> {
        let limit = self.lock_gate()?.capacity_limit().get();
        let removed = {
            let mut store = self.lock_store()?;
            self.registration.clear_all(&mut store, now_from(now_ns))?
        };
        self.admin_action("CLEARED", limit, Some(removed))
    }

    pub fn reload_config(&self) -> Result<AdminActionResponse, AdapterError> {
        let limit = self.lock_gate()?.reload()?.capacity_limit;
        self.admin_action("RELOADED", limit.get(), None)
    }

    /// One outbox pass, waiting for any pass already running.
    pub fn run_mirror_sync_worker_pass(
        &self,
        worker_id: &str,
        now_ns: Option<u64>,
    ) -> Result<MirrorSyncWorkerPassMetrics, AdapterError> {
        let started_at = now_from(now_ns);
        let metrics = self
            .mirror
            .run_pass(&self.store, worker_id, || now_from(now_ns));
        self.record_worker_pass(started_at.0, &metrics)?;
        Ok(metrics?)
    }

    /// One outbox pass unless another is running, in which case `Ok(None)`.
    pub fn try_run_mirror_sync_worker_pass(
        &self,
        worker_id: &str,
        now_ns: Option<u64>,
    ) -> Result<Option<MirrorSyncWorkerPassMetrics>, AdapterError> {
        let started_at = now_from(now_ns);
        let metrics = match self
            .mirror
            .try_run_pass(&self.store, worker_id, || now_from(now_ns))
        {
            Ok(None) => return Ok(None),
            Ok(Some(m)) => Ok(m),
            Err(err) => Err(err),
        };
        self.record_worker_pass(started_at.0, &metrics)?;
        Ok(Some(metrics?))
    }

    pub fn requeue_dead_letters(
        &self,
        now_ns: Option<u64>,
    ) -> Result<MirrorRequeueResponse, AdapterError> {
        let mut store = self.lock_store()?;
        let requeued_count = requeue_dead_letter_jobs(&mut store)?;
        Ok(MirrorRequeueResponse {
            status: "ok".to_string(),
            requeued_count,
            queue: snapshot_queue_metrics(&store, now_from(now_ns)).into(),
        })
    }

    pub fn health_report(&self, now_ns: Option<u64>) -> Result<AdapterHealthResponse, AdapterError> {
        let now = now_from(now_ns);
        let store = self.lock_store()?;
        let queue = snapshot_queue_metrics(&store, now).into();
        let registrations = store.registration_count();
        drop(store);
        let worker = self
            .sync_worker_counters
            .lock()
            .map_err(|_| AdapterError::lock_poisoned("sync worker counters"))?
            .clone();
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
            registrations,
            sync: AdapterSyncHealth {
                mirror_mode: self.mirror.sender().mode().to_string(),
                worker,
                queue,
            },
        })
    }

    fn capacity_snapshot(&self) -> Result<CapacitySnapshot, AdapterError> {
        let limit = self.lock_gate()?.capacity_limit();
        let count = self.lock_store()?.registration_count();
        Ok(CapacitySnapshot::new(count, limit))
    }

    fn admin_action(
        &self,
        outcome: &str,
        limit: u16,
        removed: Option<usize>,
    ) -> Result<AdminActionResponse, AdapterError> {
        let count = self.lock_store()?.registration_count();
        Ok(AdminActionResponse {
            status: "ok".to_string(),
            outcome: outcome.to_string(),
            limit,
            count,
            removed,
        })
    }

    fn record_worker_pass(
        &self,
        now_ns: u64,
        metrics: &Result<MirrorSyncWorkerPassMetrics, SignupError>,
    ) -> Result<(), AdapterError> {
        let mut counters = self
            .sync_worker_counters
            .lock()
            .map_err(|_| AdapterError::lock_poisoned("sync worker counters"))?;
        counters.pass_count = counters.pass_count.saturating_add(1);
        counters.last_pass_at_ns = Some(now_ns);
        match metrics {
            Ok(m) => {
                counters.dequeued_total = counters.dequeued_total.saturating_add(m.dequeued_count as u64);
                counters.acked_total = counters.acked_total.saturating_add(m.acked_count as u64);
                counters.retry_scheduled_total = counters
                    .retry_scheduled_total
                    .saturating_add(m.retry_scheduled_count as u64);
                counters.dead_lettered_total = counters
                    .dead_lettered_total
                    .saturating_add(m.dead_lettered_count as u64);
                counters.last_dequeued_count = m.dequeued_count;
                counters.last_acked_count = m.acked_count;
                counters.last_retry_scheduled_count = m.retry_scheduled_count;
                counters.last_dead_lettered_count = m.dead_lettered_count;
                counters.last_error = None;
            }
            Err(err) => counters.last_error = Some(err.to_string()),
        }
        Ok(())
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, SignupStore>, AdapterError> {
        self.store
            .lock()
            .map_err(|_| AdapterError::lock_poisoned("signup store"))
    }

    fn lock_auth(&self) -> Result<MutexGuard<'_, AdminAuthRuntime>, AdapterError> {
        self.auth
            .lock()
            .map_err(|_| AdapterError::lock_poisoned("admin auth"))
    }

    fn lock_gate(&self) -> Result<MutexGuard<'_, GateConfigRuntime>, AdapterError> {
        self.gate
            .lock()
            .map_err(|_| AdapterError::lock_poisoned("gate config"))
    }
}

pub fn system_time_now_ns() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    u64::try_from(nanos).unwrap_or(u64::MAX)
}

fn now_from(now_ns: Option<u64>) -> MonotonicTimeNs {
    MonotonicTimeNs(now_ns.unwrap_or_else(system_time_now_ns).max(1))
}
