//! Control server: a loopback HTTP facade over the pool and runners.
//!
//! The surface is deliberately unauthenticated — it is meant to bind to
//! 127.0.0.1 and serve a colocated agent host.  All bodies are JSON, and
//! guest command failures are *successful* responses (the command ran;
//! its exit code says the rest).  Only transport and lifecycle faults map
//! to HTTP errors.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CarapaceError;
use crate::metrics::{Gauges, Metrics};
use crate::pool::{PoolStats, WarmPool};
use crate::runner::{ExecResult, Guest, PipelineResult, run_pipeline_on};

/// Request bodies above this are rejected with 413.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Upper bound accepted by `/pool/resize`.
const MAX_RESIZE_TARGET: usize = 16;

/// A checked-out VM plus its caller-supplied bookkeeping.
struct ActiveVm<V> {
    vm: Arc<V>,
    acquired_at: Instant,
    metadata: Option<Value>,
}

/// Shared state behind every handler.
pub struct AppState<V: Guest> {
    pool: Arc<WarmPool<V>>,
    active: Mutex<HashMap<String, ActiveVm<V>>>,
    metrics: Metrics,
    started_at: Instant,
}

pub type SharedState<V> = Arc<AppState<V>>;

impl<V: Guest> AppState<V> {
    pub fn new(pool: Arc<WarmPool<V>>) -> SharedState<V> {
        Arc::new(Self {
            pool,
            active: Mutex::new(HashMap::new()),
            metrics: Metrics::new(),
            started_at: Instant::now(),
        })
    }

    fn lookup(&self, id: &str) -> Result<Arc<V>, ApiError> {
        self.active
            .lock()
            .expect("active registry lock poisoned")
            .get(id)
            .map(|a| Arc::clone(&a.vm))
            .ok_or_else(|| ApiError::NotFound(format!("unknown VM '{id}'")))
    }

    /// Release every active VM, then stop the pool.  Called after the
    /// listener has stopped accepting.
    pub async fn shutdown(&self) {
        let drained: Vec<ActiveVm<V>> = {
            let mut active = self.active.lock().expect("active registry lock poisoned");
            active.drain().map(|(_, v)| v).collect()
        };
        let shutdowns = drained.into_iter().map(|a| async move { a.vm.shutdown().await });
        futures_util::future::join_all(shutdowns).await;
        self.pool.stop().await;
    }
}

/// Build the route table.
pub fn router<V: Guest>(state: SharedState<V>) -> Router {
    Router::new()
        .route("/health", get(health::<V>))
        .route("/metrics", get(metrics::<V>))
        .route("/vms", get(list_vms::<V>))
        .route("/vms/acquire", post(acquire::<V>))
        .route("/vms/{id}/run", post(run::<V>))
        .route("/vms/{id}/pipeline", post(pipeline::<V>))
        .route("/vms/{id}/release", post(release::<V>))
        .route("/pool/status", get(pool_status::<V>))
        .route("/pool/resize", post(resize::<V>))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Bind, serve until `shutdown` resolves, then drain VMs and stop the
/// pool.  In-flight requests get to finish; new connections are refused
/// once the signal fires.
pub async fn serve<V: Guest>(
    state: SharedState<V>,
    bind: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), CarapaceError> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| CarapaceError::io(format!("binding control server to {bind}"), e))?;
    let addr = listener
        .local_addr()
        .map_err(|e| CarapaceError::io("reading listener address", e))?;
    tracing::info!(%addr, "control server listening");

    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| CarapaceError::io("control server", e))?;

    state.shutdown().await;
    Ok(())
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize, Default)]
#[serde(default)]
struct AcquireRequest {
    timeout_ms: Option<u64>,
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
struct AcquireResponse {
    id: String,
    ssh_port: u16,
    user: String,
    created_at_ms: u64,
    metadata: Option<Value>,
}

#[derive(Debug, serde::Deserialize)]
struct RunRequest {
    command: String,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, serde::Deserialize)]
struct PipelineRequest {
    commands: Vec<String>,
    #[serde(default)]
    stop_on_error: Option<bool>,
}

#[derive(Debug, serde::Deserialize)]
struct ResizeRequest {
    size: usize,
}

#[derive(Debug, Serialize)]
struct ResizeResponse {
    new_size: usize,
    pool: PoolStats,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
    pool: PoolStats,
    active_vms: usize,
}

#[derive(Debug, Serialize)]
struct VmInfo {
    id: String,
    age_seconds: u64,
    metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
struct PoolStatusResponse {
    stats: PoolStats,
    status_line: String,
}

#[derive(Debug, Serialize)]
struct ReleaseResponse {
    released: String,
}

// ── Error mapping ────────────────────────────────────────────────────

enum ApiError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge,
    ServiceUnavailable(String),
    Internal(String),
}

impl From<CarapaceError> for ApiError {
    fn from(err: CarapaceError) -> Self {
        match err {
            CarapaceError::Validation { message } => ApiError::BadRequest(message),
            CarapaceError::NotFound { id } => ApiError::NotFound(format!("unknown VM '{id}'")),
            CarapaceError::PoolExhausted { waited_ms } => ApiError::ServiceUnavailable(format!(
                "no warm VM became available within {waited_ms}ms"
            )),
            CarapaceError::PoolStopped => {
                ApiError::ServiceUnavailable("pool is stopped".into())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "request body exceeds 1 MiB".into())
            }
            ApiError::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// JSON extractor with this API's status conventions: malformed or
/// incomplete bodies are 400 (not axum's 422), oversized bodies are 413,
/// and an empty body reads as `{}` so POSTs without arguments stay
/// ergonomic.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|rejection: BytesRejection| {
                if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    ApiError::PayloadTooLarge
                } else {
                    ApiError::BadRequest(rejection.to_string())
                }
            })?;
        let slice: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
        serde_json::from_slice(slice)
            .map(ApiJson)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn health<V: Guest>(State(state): State<SharedState<V>>) -> axum::Json<HealthResponse> {
    let pool = state.pool.stats();
    let active_vms = state.active.lock().expect("active registry lock poisoned").len();
    axum::Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.started_at.elapsed().as_secs(),
        pool,
        active_vms,
    })
}

async fn metrics<V: Guest>(State(state): State<SharedState<V>>) -> String {
    let pool = state.pool.stats();
    let active_vms = state.active.lock().expect("active registry lock poisoned").len();
    state.metrics.render(Gauges {
        active_vms: active_vms as u64,
        pool_warm: pool.warm as u64,
        pool_booting: pool.booting as u64,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn list_vms<V: Guest>(State(state): State<SharedState<V>>) -> axum::Json<Vec<VmInfo>> {
    let active = state.active.lock().expect("active registry lock poisoned");
    let mut vms: Vec<VmInfo> = active
        .iter()
        .map(|(id, a)| VmInfo {
            id: id.clone(),
            age_seconds: a.acquired_at.elapsed().as_secs(),
            metadata: a.metadata.clone(),
        })
        .collect();
    vms.sort_by(|a, b| a.id.cmp(&b.id));
    axum::Json(vms)
}

async fn acquire<V: Guest>(
    State(state): State<SharedState<V>>,
    ApiJson(body): ApiJson<AcquireRequest>,
) -> Result<axum::Json<AcquireResponse>, ApiError> {
    let vm = match state.pool.acquire(body.timeout_ms).await {
        Ok(vm) => vm,
        Err(e) => {
            Metrics::inc(&state.metrics.acquire_errors_total);
            return Err(e.into());
        }
    };
    Metrics::inc(&state.metrics.acquire_total);

    let id = uuid::Uuid::new_v4().to_string();
    let endpoint = vm.endpoint();
    let created_at_ms = unix_millis();
    state
        .active
        .lock()
        .expect("active registry lock poisoned")
        .insert(
            id.clone(),
            ActiveVm {
                vm,
                acquired_at: Instant::now(),
                metadata: body.metadata.clone(),
            },
        );
    tracing::info!(%id, "VM acquired");
    Ok(axum::Json(AcquireResponse {
        id,
        ssh_port: endpoint.ssh_port,
        user: endpoint.user,
        created_at_ms,
        metadata: body.metadata,
    }))
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

async fn run<V: Guest>(
    State(state): State<SharedState<V>>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<RunRequest>,
) -> Result<axum::Json<ExecResult>, ApiError> {
    if body.command.is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".into()));
    }
    let vm = state.lookup(&id)?;
    Metrics::inc(&state.metrics.run_total);

    let timeout = body.timeout_seconds.map(std::time::Duration::from_secs);
    match vm.exec(&body.command, timeout).await {
        Ok(result) => Ok(axum::Json(result)),
        Err(e) => {
            Metrics::inc(&state.metrics.run_errors_total);
            Err(e.into())
        }
    }
}

async fn pipeline<V: Guest>(
    State(state): State<SharedState<V>>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<PipelineRequest>,
) -> Result<axum::Json<PipelineResult>, ApiError> {
    if body.commands.is_empty() {
        return Err(ApiError::BadRequest("commands must not be empty".into()));
    }
    let vm = state.lookup(&id)?;

    let stop_on_error = body.stop_on_error.unwrap_or(true);
    let result = run_pipeline_on(vm.as_ref(), &body.commands, stop_on_error).await;
    for _ in 0..result.results.len() {
        Metrics::inc(&state.metrics.run_total);
    }
    if result.error.is_some() {
        Metrics::inc(&state.metrics.run_errors_total);
    }
    Ok(axum::Json(result))
}

async fn release<V: Guest>(
    State(state): State<SharedState<V>>,
    Path(id): Path<String>,
) -> Result<axum::Json<ReleaseResponse>, ApiError> {
    let entry = state
        .active
        .lock()
        .expect("active registry lock poisoned")
        .remove(&id)
        .ok_or_else(|| ApiError::NotFound(format!("unknown VM '{id}'")))?;

    state.pool.release(&entry.vm);
    Metrics::inc(&state.metrics.release_total);
    tracing::info!(%id, "VM released");
    Ok(axum::Json(ReleaseResponse { released: id }))
}

async fn pool_status<V: Guest>(
    State(state): State<SharedState<V>>,
) -> axum::Json<PoolStatusResponse> {
    axum::Json(PoolStatusResponse {
        stats: state.pool.stats(),
        status_line: state.pool.status_line(),
    })
}

async fn resize<V: Guest>(
    State(state): State<SharedState<V>>,
    ApiJson(body): ApiJson<ResizeRequest>,
) -> Result<axum::Json<ResizeResponse>, ApiError> {
    if body.size > MAX_RESIZE_TARGET {
        return Err(ApiError::BadRequest(format!(
            "size must be between 0 and {MAX_RESIZE_TARGET}"
        )));
    }
    let pool = state.pool.resize(body.size);
    tracing::info!(new_size = body.size, "pool resized");
    Ok(axum::Json(ResizeResponse {
        new_size: body.size,
        pool,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carapace_errors_map_to_expected_statuses() {
        let cases: Vec<(CarapaceError, StatusCode)> = vec![
            (
                CarapaceError::Validation {
                    message: "bad".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                CarapaceError::NotFound { id: "x".into() },
                StatusCode::NOT_FOUND,
            ),
            (
                CarapaceError::PoolExhausted { waited_ms: 10 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (CarapaceError::PoolStopped, StatusCode::SERVICE_UNAVAILABLE),
            (
                CarapaceError::Internal {
                    message: "boom".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                CarapaceError::Transport {
                    context: "ssh".into(),
                    source: None,
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let api: ApiError = err.into();
            let response = api.into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn payload_too_large_is_413() {
        let response = ApiError::PayloadTooLarge.into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
