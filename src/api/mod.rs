//! HTTP surface.
//!
//! | Method | Path | Action |
//! |---|---|---|
//! | GET | `/api/jobs` | list (`?status=running,paused&kind=...`) |
//! | POST | `/api/jobs` | start a job (gated) |
//! | GET | `/api/jobs/:id` | fetch one job |
//! | POST | `/api/jobs/:id/{pause,resume,cancel,restart}` | lifecycle actions |
//! | POST | `/api/jobs/:id/chunks` | run exactly one chunk |
//! | GET | `/api/health` | gate snapshot and admission decision |
//! | GET | `/api/monitor` | resume stats and per-job health |
//! | POST | `/api/monitor/sweep` | run one watchdog sweep now |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::RelayError;
use crate::gate::Admission;
use crate::job::{Checkpoint, Job, JobSpec, JobStatus};
use crate::monitor::{JobHealthEntry, ResumeStats, SweepReport};
use crate::service::{GateStatus, JobService};
use crate::store::JobFilter;
use crate::worker::{ChunkReport, ChunkRequest};

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<JobService>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::JobNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::AlreadyClaimed { .. }
            | RelayError::LeaseLost { .. }
            | RelayError::Terminal(_) => StatusCode::CONFLICT,
            RelayError::AdmissionRejected(_) | RelayError::StoreFull(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::InvalidSpec(_)
            | RelayError::CheckpointRewind { .. }
            | RelayError::CheckpointShape { .. }
            | RelayError::CheckpointOutOfRange { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Deserialize, Default)]
struct ListQuery {
    /// Comma-separated statuses.
    status: Option<String>,
    kind: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkBody {
    #[serde(default)]
    continue_from: Option<Checkpoint>,
}

#[derive(Serialize)]
struct HealthResponse {
    gate: GateStatus,
    admission: Admission,
}

#[derive(Serialize)]
struct MonitorResponse {
    stats: ResumeStats,
    jobs: Vec<JobHealthEntry>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(start_job_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/api/jobs/:id/pause", post(pause_job_handler))
        .route("/api/jobs/:id/resume", post(resume_job_handler))
        .route("/api/jobs/:id/cancel", post(cancel_job_handler))
        .route("/api/jobs/:id/restart", post(restart_job_handler))
        .route("/api/jobs/:id/chunks", post(run_chunk_handler))
        .route("/api/health", get(health_handler))
        .route("/api/monitor", get(monitor_handler))
        .route("/api/monitor/sweep", post(sweep_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "API server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn list_jobs_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Job>>, RelayError> {
    let mut filter = JobFilter::all();
    if let Some(statuses) = query.status.as_deref().filter(|s| !s.is_empty()) {
        filter.statuses = statuses
            .split(',')
            .map(|s| s.trim().parse::<JobStatus>())
            .collect::<Result<_, _>>()
            .map_err(RelayError::InvalidSpec)?;
    }
    if let Some(kind) = query.kind {
        filter = filter.with_kind(kind);
    }
    Ok(Json(state.service.list(&filter).await))
}

async fn start_job_handler(
    State(state): State<ApiState>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<Job>), RelayError> {
    let job = state.service.start(spec).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, RelayError> {
    Ok(Json(state.service.get(id).await?))
}

async fn pause_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, RelayError> {
    Ok(Json(state.service.pause(id).await?))
}

async fn resume_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, RelayError> {
    Ok(Json(state.service.resume(id).await?))
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, RelayError> {
    Ok(Json(state.service.cancel(id).await?))
}

async fn restart_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, RelayError> {
    Ok(Json(state.service.restart(id).await?))
}

async fn run_chunk_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<ChunkReport>, RelayError> {
    // An empty body runs from the stored checkpoint; anything else must parse.
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        ChunkBody::default()
    } else {
        serde_json::from_slice::<ChunkBody>(&body)
            .map_err(|e| RelayError::InvalidSpec(format!("invalid chunk request: {}", e)))?
    };
    let request = ChunkRequest {
        job_id: id,
        continue_from: body.continue_from,
    };
    Ok(Json(state.service.run_chunk(request).await?))
}

async fn health_handler(State(state): State<ApiState>) -> Result<Json<HealthResponse>, RelayError> {
    let gate = state.service.gate_status().await?;
    let admission = state.service.admission().await;
    Ok(Json(HealthResponse { gate, admission }))
}

async fn monitor_handler(State(state): State<ApiState>) -> Json<MonitorResponse> {
    let monitor = state.service.monitor();
    Json(MonitorResponse {
        stats: monitor.stats().await,
        jobs: monitor.job_health().await,
    })
}

async fn sweep_handler(State(state): State<ApiState>) -> Json<SweepReport> {
    Json(state.service.monitor().sweep().await)
}
