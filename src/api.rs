//! HTTP surface: a thin axum layer over the orchestrator and stores.

use crate::collect::model::{
    CollectionTask, RecordPage, RecordQuery, Source, TraceRecord, DEFAULT_TASK_LIST_LIMIT,
};
use crate::collect::orchestrator::{CollectRequest, OrchestratorError};
use crate::collect::store::StoreError;
use crate::core::types::*;
use crate::core::AppState;
use crate::trace::{parse_trace, parse_trace_as, CompileError};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(message)))
}

fn store_error(e: StoreError) -> ApiError {
    error!("store error: {}", e);
    match e {
        StoreError::NotFound(what) => api_error(StatusCode::NOT_FOUND, what),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

fn orchestrator_error(e: OrchestratorError) -> ApiError {
    let status = match &e {
        OrchestratorError::NotActive(_) | OrchestratorError::SourceNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::NoKeywords
        | OrchestratorError::MissingListTrace(_)
        | OrchestratorError::Trace(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("collection error: {}", e);
    }
    api_error(status, e.to_string())
}

fn compile_error(e: CompileError) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, format!("invalid trace: {}", e))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/collect", post(start_collection))
        .route("/api/collect/tasks", get(list_tasks))
        .route("/api/collect/task", get(get_task))
        .route("/api/collect/cancel", post(cancel_task))
        .route(
            "/api/traces",
            get(list_traces).post(upload_trace).delete(delete_trace),
        )
        .route("/api/sources", get(list_sources).post(save_source))
        .route("/api/tenders", get(query_tenders))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_tasks: state.orchestrator.registry().active_count(),
    })
}

async fn start_collection(
    State(state): State<AppState>,
    Json(request): Json<CollectRequest>,
) -> ApiResult<CollectionTask> {
    let task = state
        .orchestrator
        .submit(request)
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(task))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Vec<CollectionTask>> {
    let limit = q.limit.unwrap_or(DEFAULT_TASK_LIST_LIMIT);
    let tasks = state.stores.tasks.list(limit).await.map_err(store_error)?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<AppState>,
    Query(q): Query<TaskIdQuery>,
) -> ApiResult<CollectionTask> {
    match state.stores.tasks.get(&q.id).await.map_err(store_error)? {
        Some(task) => Ok(Json(task)),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("task not found: {}", q.id),
        )),
    }
}

async fn cancel_task(
    State(state): State<AppState>,
    Query(q): Query<TaskIdQuery>,
) -> ApiResult<CancelResponse> {
    let task = state
        .orchestrator
        .cancel(&q.id)
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(CancelResponse {
        id: task.id,
        status: task.status.to_string(),
        message: task.message,
    }))
}

async fn list_traces(State(state): State<AppState>) -> ApiResult<Vec<TraceRecord>> {
    let traces = state.stores.traces.list_traces().await.map_err(store_error)?;
    Ok(Json(traces))
}

async fn upload_trace(
    State(state): State<AppState>,
    Json(upload): Json<TraceUpload>,
) -> ApiResult<TraceUploadResponse> {
    let trace = match upload.kind {
        Some(kind) => parse_trace_as(&upload.raw_content, Some(kind)),
        None => parse_trace(&upload.raw_content),
    }
    .map_err(compile_error)?;

    if upload.analyze {
        return Ok(Json(TraceUploadResponse { saved: None, trace }));
    }

    if upload.source_id == 0 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "source_id is required to save a trace",
        ));
    }
    state
        .stores
        .sources
        .get_source(upload.source_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                format!("source {} not found", upload.source_id),
            )
        })?;

    let name = upload
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(trace.name.as_str())
        .to_string();
    let saved = state
        .stores
        .traces
        .save_trace(
            upload.source_id,
            trace.kind,
            &name,
            &upload.raw_content,
            &trace.entry_url,
        )
        .await
        .map_err(store_error)?;
    info!(
        "📥 {} trace '{}' saved for source {}",
        saved.kind, saved.name, saved.source_id
    );
    Ok(Json(TraceUploadResponse {
        saved: Some(saved),
        trace,
    }))
}

async fn delete_trace(
    State(state): State<AppState>,
    Query(q): Query<TraceIdQuery>,
) -> Result<StatusCode, ApiError> {
    if state
        .stores
        .traces
        .delete_trace(q.id)
        .await
        .map_err(store_error)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            format!("trace not found: {}", q.id),
        ))
    }
}

async fn list_sources(State(state): State<AppState>) -> ApiResult<Vec<Source>> {
    let sources = state
        .stores
        .sources
        .list_sources()
        .await
        .map_err(store_error)?;
    Ok(Json(sources))
}

async fn save_source(
    State(state): State<AppState>,
    Json(source): Json<Source>,
) -> ApiResult<Source> {
    if source.name.trim().is_empty() || source.code.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "source name and code are required",
        ));
    }
    let saved = state
        .stores
        .sources
        .save_source(source)
        .await
        .map_err(store_error)?;
    Ok(Json(saved))
}

async fn query_tenders(
    State(state): State<AppState>,
    Query(query): Query<RecordQuery>,
) -> ApiResult<RecordPage> {
    let page = state
        .stores
        .records
        .query(&query)
        .await
        .map_err(store_error)?;
    Ok(Json(page))
}
