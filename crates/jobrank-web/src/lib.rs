//! JSON API over the job store, the criteria engine and the sync pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use jobrank_core::{JobRecord, JobStatus, StoreError};
use jobrank_storage::{JobQuery, JobStats};
use jobrank_sync::{maybe_build_scheduler, Criterion, SyncPipeline, SyncRunSummary};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jobrank-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Unprocessable(String),
    Unavailable(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            Self::Internal(m) => {
                error!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::NotFound(err.to_string()),
            StoreError::Timeout(_) => Self::Unavailable(err.to_string()),
            StoreError::WriteFailure { .. } | StoreError::Backend(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

#[derive(Debug, Deserialize)]
pub struct MarkRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct TierRequest {
    pub tier: String,
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(list_jobs_handler))
        .route("/jobs/{id}", get(job_detail_handler))
        .route("/jobs/{id}/mark", post(mark_job_handler))
        .route("/criteria", get(list_criteria_handler))
        .route(
            "/criteria/{name}",
            put(set_criterion_handler).delete(remove_criterion_handler),
        )
        .route("/criteria/{name}/active", put(set_active_handler))
        .route("/stats", get(stats_handler))
        .route("/runs", post(run_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<SyncPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "jobrank api listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

/// Serves the API with the cron scheduler running alongside when enabled.
pub async fn serve_with_scheduler(pipeline: Arc<SyncPipeline>, port: u16) -> anyhow::Result<()> {
    let scheduler = maybe_build_scheduler(Arc::clone(&pipeline)).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
        info!(cron = %pipeline.config().sync_cron, "scheduler started");
    }
    serve(pipeline, port).await
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn list_jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobQuery>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    Ok(Json(state.pipeline.store().list(&query).await?))
}

async fn job_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<JobRecord>, ApiError> {
    state
        .pipeline
        .store()
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))
}

async fn mark_job_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(request): Json<MarkRequest>,
) -> Result<Json<JobRecord>, ApiError> {
    let status = request
        .status
        .parse::<JobStatus>()
        .map_err(|e| ApiError::Unprocessable(e.to_string()))?;
    let record = state.pipeline.store().set_status(&id, status).await?;
    info!(identifier = %id, %status, "job marked");
    Ok(Json(record))
}

async fn list_criteria_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Criterion>> {
    Json(state.pipeline.engine().snapshot().iter().cloned().collect())
}

async fn set_criterion_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Json(request): Json<TierRequest>,
) -> Result<Json<Criterion>, ApiError> {
    let engine = state.pipeline.engine();
    engine
        .set_criterion(&name, &request.tier)
        .map_err(|e| ApiError::Unprocessable(e.to_string()))?;
    state.pipeline.save_criteria().await?;
    engine
        .snapshot()
        .find(&name)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("criterion {name} not found")))
}

async fn set_active_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Json(request): Json<ActiveRequest>,
) -> Result<Json<Criterion>, ApiError> {
    let criterion = state
        .pipeline
        .engine()
        .set_active(&name, request.active)
        .ok_or_else(|| ApiError::NotFound(format!("criterion {name} not found")))?;
    state.pipeline.save_criteria().await?;
    info!(criterion = %criterion.name, active = criterion.active, "criterion toggled");
    Ok(Json(criterion))
}

async fn remove_criterion_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<StatusCode, ApiError> {
    if state.pipeline.engine().remove(&name).is_none() {
        return Err(ApiError::NotFound(format!("criterion {name} not found")));
    }
    state.pipeline.save_criteria().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Json<JobStats>, ApiError> {
    Ok(Json(state.pipeline.store().stats().await?))
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Result<Json<SyncRunSummary>, ApiError> {
    Ok(Json(state.pipeline.run_once().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use jobrank_adapters::FileBatchFetcher;
    use jobrank_core::Tier;
    use jobrank_storage::MemoryJobStore;
    use jobrank_sync::{CriteriaEngine, CriteriaSet, PipelineConfig, ScoringConfig};
    use tower::ServiceExt;

    const AIRTABLE_JOB: &str = "021785512345678901";

    fn sample_batch() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/batches/sample.json")
    }

    fn test_app(root: &Path) -> Router {
        let config = PipelineConfig {
            workspace_root: root.to_path_buf(),
            ..Default::default()
        };
        let pipeline = SyncPipeline::new(
            config,
            Arc::new(FileBatchFetcher::new(sample_batch())),
            Arc::new(MemoryJobStore::new()),
            Arc::new(CriteriaEngine::new(CriteriaSet::defaults(), ScoringConfig::default())),
            None,
        );
        app(AppState::new(Arc::new(pipeline)))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn run_then_list_ranked_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        let (status, summary) = send(&app, "POST", "/runs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["batch"]["ranked"], 3);

        let (status, jobs) = send(&app, "GET", "/jobs?sort_by=score&order=desc", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(jobs.as_array().map(Vec::len), Some(3));
        assert_eq!(jobs[0]["candidate"]["identifier"], AIRTABLE_JOB);

        let (_, high) = send(&app, "GET", "/jobs?priority=High", None).await;
        assert_eq!(high.as_array().map(Vec::len), Some(1));

        let (_, hourly) = send(&app, "GET", "/jobs?job_type=Hourly&keyword=LOGO", None).await;
        assert_eq!(hourly.as_array().map(Vec::len), Some(1));

        let (status, _) = send(&app, "GET", "/jobs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mark_persists_status_and_rejects_unknowns() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        send(&app, "POST", "/runs", None).await;

        let uri = format!("/jobs/{AIRTABLE_JOB}/mark");
        let (status, record) = send(&app, "POST", &uri, Some(r#"{"status":"not interested"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["status"], "Not Interested");

        let (status, _) = send(&app, "POST", &uri, Some(r#"{"status":"archived"}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(&app, "POST", "/jobs/404/mark", Some(r#"{"status":"Applied"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, stats) = send(&app, "GET", "/stats", None).await;
        assert_eq!(stats["total"], 3);
        assert_eq!(stats["by_status"]["Not Interested"], 1);
        assert_eq!(stats["by_status"]["New"], 2);
    }

    #[tokio::test]
    async fn criteria_edits_are_validated_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        let (status, _) = send(&app, "PUT", "/criteria/webflow", Some(r#"{"tier":"urgent"}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = send(&app, "PUT", "/criteria/webflow", Some(r#"{"tier":"high"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tier"], "High");

        let saved = std::fs::read_to_string(dir.path().join("rules/criteria.yaml")).unwrap();
        let reloaded = jobrank_sync::parse_criteria_yaml(&saved).unwrap();
        assert_eq!(reloaded.get("webflow"), Some(Tier::High));
        assert_eq!(reloaded.len(), 6);

        let (status, body) = send(&app, "PUT", "/criteria/WEBFLOW/active", Some(r#"{"active":false}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "webflow");
        assert_eq!(body["active"], false);
        let saved = std::fs::read_to_string(dir.path().join("rules/criteria.yaml")).unwrap();
        let reloaded = jobrank_sync::parse_criteria_yaml(&saved).unwrap();
        assert_eq!(reloaded.find("webflow").map(|c| c.active), Some(false));

        let (status, _) = send(&app, "PUT", "/criteria/nope/active", Some(r#"{"active":true}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "DELETE", "/criteria/webflow", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", "/criteria/webflow", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, listed) = send(&app, "GET", "/criteria", None).await;
        assert_eq!(listed.as_array().map(Vec::len), Some(5));
    }
}
