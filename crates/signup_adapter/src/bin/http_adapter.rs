#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, time::Duration};

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use signup_adapter::{
    admin_password_from_headers, AdapterError, AdapterHealthResponse, AdapterSyncHealth,
    AdminActionResponse, AdminRegistrationsResponse, LookupResponse, MirrorRequeueResponse,
    MirrorSyncPassResponse, SignupRuntime, StatusResponse, SubmitRegistrationRequest,
    SubmitRegistrationResponse, UpdateSettingsRequest, MIRROR_MANUAL_WORKER_ID,
    MIRROR_WORKER_ID,
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const INDEX_HTML: &str = include_str!("../web/index.html");

#[derive(Debug, serde::Deserialize)]
struct LookupQuery {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Default, serde::Deserialize)]
struct AdminLoginRequest {
    #[serde(default)]
    password: String,
}

#[derive(Debug, serde::Serialize)]
struct AdminLoginResponse {
    status: String,
    outcome: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = env::var("SIGNUP_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;
    let sync_worker_enabled = parse_sync_worker_enabled_from_env();
    let sync_worker_interval_ms = parse_sync_worker_interval_ms_from_env();

    let runtime = SignupRuntime::default_from_env()?;
    if sync_worker_enabled {
        let runtime_for_worker = runtime.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(sync_worker_interval_ms));
            loop {
                ticker.tick().await;
                let rt = runtime_for_worker.clone();
                // a manual pass in progress covers this tick
                let pass = tokio::task::spawn_blocking(move || {
                    rt.try_run_mirror_sync_worker_pass(MIRROR_WORKER_ID, None)
                })
                .await;
                match pass {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => error!(error = %err, "mirror sync worker pass failed"),
                    Err(err) => error!(error = %err, "mirror sync worker task aborted"),
                }
            }
        });
    }

    let app = Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/v1/status", get(status))
        .route("/v1/registrations", post(submit_registration))
        .route("/v1/registrations/lookup", get(lookup))
        .route("/v1/admin/login", post(admin_login))
        .route("/v1/admin/registrations", get(admin_registrations))
        .route("/v1/admin/export.csv", get(admin_export_csv))
        .route("/v1/admin/settings", put(admin_update_settings))
        .route("/v1/admin/clear", post(admin_clear))
        .route("/v1/admin/config/reload", post(admin_reload_config))
        .route("/v1/admin/mirror/sync", post(admin_mirror_sync))
        .route("/v1/admin/mirror/requeue", post(admin_mirror_requeue))
        .with_state(runtime);

    info!(
        %addr,
        sync_worker_enabled,
        sync_worker_interval_ms,
        "signup_http listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("signup_http stopped");
    Ok(())
}

fn parse_sync_worker_enabled_from_env() -> bool {
    match env::var("SIGNUP_SYNC_WORKER_ENABLED") {
        Ok(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        Err(_) => true,
    }
}

fn parse_sync_worker_interval_ms_from_env() -> u64 {
    env::var("SIGNUP_SYNC_WORKER_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| (100..=60_000).contains(v))
        .unwrap_or(1_000)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c, shutting down"),
            Err(err) => {
                error!(error = %err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(err) => {
                error!(error = %err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn healthz(
    State(runtime): State<SignupRuntime>,
) -> (StatusCode, Json<AdapterHealthResponse>) {
    match runtime.health_report(None) {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(AdapterHealthResponse {
                status: "error".to_string(),
                outcome: "UNHEALTHY".to_string(),
                reason: Some(err.to_string()),
                registrations: 0,
                sync: AdapterSyncHealth::default(),
            }),
        ),
    }
}

async fn status(State(runtime): State<SignupRuntime>) -> Result<Json<StatusResponse>, AdapterError> {
    Ok(Json(runtime.status()?))
}

async fn submit_registration(
    State(runtime): State<SignupRuntime>,
    Json(request): Json<SubmitRegistrationRequest>,
) -> Result<(StatusCode, Json<SubmitRegistrationResponse>), AdapterError> {
    let response = runtime.submit_registration(request, None)?;
    let status = if response.is_full() {
        StatusCode::CONFLICT
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(response)))
}

async fn lookup(
    State(runtime): State<SignupRuntime>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<LookupResponse>, AdapterError> {
    Ok(Json(runtime.lookup(&query.email)?))
}

async fn admin_login(
    State(runtime): State<SignupRuntime>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<AdminLoginRequest>>,
) -> Result<Json<AdminLoginResponse>, AdapterError> {
    let body_password = body.map(|Json(b)| b.password).filter(|p| !p.is_empty());
    let password =
        body_password.or_else(|| admin_password_from_headers(&headers).map(str::to_string));
    authorize_blocking(runtime, client_key(&peer), password).await?;
    Ok(Json(AdminLoginResponse {
        status: "ok".to_string(),
        outcome: "GRANTED".to_string(),
    }))
}

async fn admin_registrations(
    State(runtime): State<SignupRuntime>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<AdminRegistrationsResponse>, AdapterError> {
    require_admin(&runtime, &peer, &headers).await?;
    Ok(Json(runtime.admin_registrations()?))
}

async fn admin_export_csv(
    State(runtime): State<SignupRuntime>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, AdapterError> {
    require_admin(&runtime, &peer, &headers).await?;
    let body = runtime.export_csv()?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"signup_data.csv\"",
            ),
        ],
        body,
    )
        .into_response())
}

async fn admin_update_settings(
    State(runtime): State<SignupRuntime>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<AdminActionResponse>, AdapterError> {
    require_admin(&runtime, &peer, &headers).await?;
    Ok(Json(runtime.update_settings(request)?))
}

async fn admin_clear(
    State(runtime): State<SignupRuntime>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<AdminActionResponse>, AdapterError> {
    require_admin(&runtime, &peer, &headers).await?;
    let response = runtime.clear_all(None)?;
    warn!(client = %peer.ip(), removed = ?response.removed, "all registrations cleared");
    Ok(Json(response))
}

async fn admin_reload_config(
    State(runtime): State<SignupRuntime>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<AdminActionResponse>, AdapterError> {
    require_admin(&runtime, &peer, &headers).await?;
    Ok(Json(runtime.reload_config()?))
}

async fn admin_mirror_sync(
    State(runtime): State<SignupRuntime>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<MirrorSyncPassResponse>, AdapterError> {
    require_admin(&runtime, &peer, &headers).await?;
    let metrics = tokio::task::spawn_blocking(move || {
        runtime.run_mirror_sync_worker_pass(MIRROR_MANUAL_WORKER_ID, None)
    })
    .await
    .map_err(|err| AdapterError::Internal(format!("mirror sync task aborted: {err}")))??;
    Ok(Json(metrics.into()))
}

async fn admin_mirror_requeue(
    State(runtime): State<SignupRuntime>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<MirrorRequeueResponse>, AdapterError> {
    require_admin(&runtime, &peer, &headers).await?;
    let response = runtime.requeue_dead_letters(None)?;
    info!(client = %peer.ip(), requeued = response.requeued_count, "dead-lettered mirror jobs requeued");
    Ok(Json(response))
}

async fn require_admin(
    runtime: &SignupRuntime,
    peer: &SocketAddr,
    headers: &HeaderMap,
) -> Result<(), AdapterError> {
    let password = admin_password_from_headers(headers).map(str::to_string);
    authorize_blocking(runtime.clone(), client_key(peer), password).await
}

/// Password hashing is CPU-bound, so it runs off the async workers.
async fn authorize_blocking(
    runtime: SignupRuntime,
    client: String,
    password: Option<String>,
) -> Result<(), AdapterError> {
    tokio::task::spawn_blocking(move || runtime.authorize_admin(&client, password.as_deref(), None))
        .await
        .map_err(|err| AdapterError::Internal(format!("admin auth task aborted: {err}")))?
}

fn client_key(peer: &SocketAddr) -> String {
    peer.ip().to_string()
}
