//! HTTP surface over the job store, lifecycle manager and reconciler.
//!
//! Handlers are thin: reads are snapshots of the store or a single substrate
//! query, writes delegate to the lifecycle manager or reconciler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cluster::{bounded, ClusterAdapter};
use crate::error::{ControlError, Result};
use crate::jobs::{JobConfig, JobRecord, JobState, JobStore, LifecycleManager, TaskType};
use crate::nodepool::Reconciler;

const DEFAULT_DURATION: i64 = 300;
const DEFAULT_NODE_COUNT: i64 = 1;

#[derive(Clone)]
pub struct ApiState {
    pub lifecycle: Arc<LifecycleManager>,
    pub reconciler: Arc<Reconciler>,
    pub store: Arc<JobStore>,
    pub cluster: Arc<dyn ClusterAdapter>,
    pub call_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    duration: Option<i64>,
    node_count: Option<i64>,
    task_type: Option<String>,
    job_id: Option<String>,
}

impl SubmitJobRequest {
    fn into_config(self) -> Result<(JobConfig, Option<String>)> {
        let duration = self.duration.unwrap_or(DEFAULT_DURATION);
        let duration = u64::try_from(duration).map_err(|_| {
            ControlError::InvalidConfig(format!("duration must be positive, got {}", duration))
        })?;

        let node_count = self.node_count.unwrap_or(DEFAULT_NODE_COUNT);
        let node_count = u32::try_from(node_count).map_err(|_| {
            ControlError::InvalidConfig(format!("node_count out of range: {}", node_count))
        })?;

        let task_type = match self.task_type.as_deref() {
            Some(name) => name.parse()?,
            None => TaskType::Training,
        };

        Ok((JobConfig::new(duration, node_count, task_type), self.job_id))
    }
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    node_count: Option<i64>,
}

#[derive(Serialize)]
struct JobView<'a> {
    status: JobState,
    config: &'a JobConfig,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl<'a> From<&'a JobRecord> for JobView<'a> {
    fn from(record: &'a JobRecord) -> Self {
        Self {
            status: record.state,
            config: &record.config,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            error: record.error.as_deref(),
        }
    }
}

/// Job id to view, serialized in creation order.
struct JobMap<'a>(&'a [JobRecord]);

impl Serialize for JobMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for record in self.0 {
            map.serialize_entry(&record.id, &JobView::from(record))?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct JobListResponse<'a> {
    jobs: JobMap<'a>,
    total_jobs: usize,
}

#[derive(Serialize)]
struct NodepoolStatusResponse {
    name: String,
    count: u32,
    vm_size: String,
    provisioning_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    power_state: Option<String>,
    desired_count: u32,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/gpu/nodepool/status", get(nodepool_status_handler))
        .route("/api/gpu/nodepool/scale", post(scale_handler))
        .route("/api/gpu/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route(
            "/api/gpu/jobs/{id}",
            get(get_job_handler).delete(cancel_job_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` fires, then drain in-flight requests.
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

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    if !state.reconciler.is_healthy().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "reason": "reconcile loop has not reached the node pool recently",
            })),
        );
    }

    match bounded(state.call_timeout, "get_nodepool", state.cluster.get_nodepool()).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "healthy" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "reason": format!("cluster unreachable: {}", e),
            })),
        ),
    }
}

async fn nodepool_status_handler(State(state): State<ApiState>) -> Result<impl IntoResponse> {
    let pool = bounded(state.call_timeout, "get_nodepool", state.cluster.get_nodepool()).await?;
    let desired_count = state.reconciler.desired_count().await;

    Ok(Json(NodepoolStatusResponse {
        name: pool.name,
        count: pool.actual_count,
        vm_size: pool.vm_size,
        provisioning_state: pool.provisioning_state.to_string(),
        power_state: pool.power_state,
        desired_count,
    }))
}

async fn scale_handler(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<ScaleRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(payload) = payload.map_err(|e| ControlError::InvalidConfig(e.body_text()))?;
    let requested = payload
        .node_count
        .ok_or_else(|| ControlError::InvalidConfig("node_count is required".to_string()))?;
    let node_count = u32::try_from(requested).map_err(|_| {
        ControlError::InvalidConfig(format!("node_count out of range: {}", requested))
    })?;

    state.reconciler.request_scale(node_count).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": format!("Scaling node pool to {} nodes", node_count),
            "node_count": node_count,
        })),
    ))
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let records = state.store.list().await;
    Json(JobListResponse {
        jobs: JobMap(&records),
        total_jobs: records.len(),
    })
    .into_response()
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let record = state.store.get(&id).await?;
    let mut body = serde_json::to_value(JobView::from(&record))
        .map_err(|e| ControlError::Internal(e.to_string()))?;
    body["job_id"] = json!(record.id);
    Ok(Json(body))
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(payload) = payload.map_err(|e| ControlError::InvalidConfig(e.body_text()))?;
    let (config, job_id) = payload.into_config()?;
    let record = state.lifecycle.submit(config, job_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "job_id": record.id,
            "status": record.state,
            "message": "Job submitted",
        })),
    ))
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let record = state.lifecycle.cancel(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": record.id,
            "status": record.state,
        })),
    ))
}
