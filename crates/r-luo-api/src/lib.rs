//! ---
//! luo_section: "05-networking-external-interfaces"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Admin HTTP surface for operators and tooling."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---

use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use r_luo_common::Generation;
use r_luo_core::{
    LiveUpdateService, ModuleVersion, ReloadError, ReloadResult, RollbackReport, StatusReport,
    WorkerSyncReport,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared API state exposed to handlers.
pub struct ApiState {
    service: Arc<LiveUpdateService>,
    start: Instant,
}

impl ApiState {
    pub fn new(service: Arc<LiveUpdateService>) -> Self {
        Self {
            service,
            start: Instant::now(),
        }
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(get_health))
        .route("/status", get(get_status))
        .route("/check", post(post_check))
        .route("/versions", get(get_versions))
        .route("/reload/:name", post(post_reload))
        .route("/reload-all", post(post_reload_all))
        .route("/rollback", post(post_rollback))
        .route("/worker-sync", get(get_worker_sync))
        .route("/trigger-all-workers", post(post_trigger_all_workers))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Spawn the admin API.
pub fn spawn_api_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<ApiServer> {
    let router = router(state);

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;
    let addr = tcp_listener
        .local_addr()
        .context("failed to read API listener address")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %addr, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    uptime_seconds: u64,
    #[serde(flatten)]
    report: StatusReport,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    kind: &'static str,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct CheckRequest {
    #[serde(default)]
    module: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    module: String,
    #[serde(default)]
    generation: Option<Generation>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    generation: Generation,
    module_list: Vec<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl From<ReloadError> for ApiError {
    fn from(err: ReloadError) -> Self {
        let status = match &err {
            ReloadError::Registry(_) if err.module().is_some() => StatusCode::NOT_FOUND,
            ReloadError::Registry(_) => StatusCode::BAD_REQUEST,
            ReloadError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ReloadError::Busy | ReloadError::Cycle(_) => StatusCode::CONFLICT,
            ReloadError::LockTimeout { .. } | ReloadError::SyncPropagation { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ReloadError::Detection { .. }
            | ReloadError::Apply { .. }
            | ReloadError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(kind = err.kind(), error = %err, "admin request failed");
        }
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            kind: self.kind,
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

async fn get_health() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        uptime_seconds: state.start.elapsed().as_secs(),
        report: state.service.status(),
    })
}

async fn post_check(
    State(state): State<Arc<ApiState>>,
    request: Option<Json<CheckRequest>>,
) -> Result<Json<ReloadResult>, ApiError> {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let result = state.service.check(request.module.as_deref()).await?;
    Ok(Json(result))
}

async fn get_versions(State(state): State<Arc<ApiState>>) -> Json<Vec<ModuleVersion>> {
    Json(state.service.versions())
}

async fn post_reload(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<ReloadResult>, ApiError> {
    Ok(Json(state.service.reload(&name).await?))
}

async fn post_reload_all(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ReloadResult>, ApiError> {
    Ok(Json(state.service.reload_all().await?))
}

async fn post_rollback(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<RollbackRequest>,
) -> Result<Json<RollbackReport>, ApiError> {
    let report = state
        .service
        .rollback(&request.module, request.generation)
        .await?;
    Ok(Json(report))
}

async fn get_worker_sync(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<WorkerSyncReport>, ApiError> {
    Ok(Json(state.service.worker_sync()?))
}

async fn post_trigger_all_workers(
    State(state): State<Arc<ApiState>>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let signal = state.service.trigger_all_workers()?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            generation: signal.generation,
            module_list: signal.module_list,
        }),
    ))
}
