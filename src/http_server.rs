//! HTTP server implementation using Axum.

use crate::auth::CallerId;
use crate::error::LabError;
use crate::identity::SandboxRef;
use crate::provisioner::LabInfo;
use crate::state::AppState;
use crate::template::{LabTemplate, Task};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// Request/Response types
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateLabRequest {
    template_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLabResponse {
    user_id: String,
    template_id: String,
    namespace: String,
    pod_name: String,
    message: &'static str,
}

#[derive(Serialize)]
struct TemplateList {
    templates: Vec<LabTemplate>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CurrentLab {
    #[serde(flatten)]
    info: LabInfo,
    title: String,
    tasks: Vec<Task>,
}

#[derive(Deserialize)]
struct TeardownParams {
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateTaskRequest {
    template_id: String,
    task_index: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateLabRequest {
    template_id: String,
}

/// A [`LabError`] rendered as `{"error": ...}` with a matching status code.
pub struct ApiError(LabError);

impl From<LabError> for ApiError {
    fn from(e: LabError) -> Self {
        Self(e)
    }
}

pub fn status_for(err: &LabError) -> StatusCode {
    match err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        LabError::SandboxNotReady { .. } | LabError::InvalidTaskIndex { .. } => StatusCode::BAD_REQUEST,
        LabError::ExecutionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/templates", get(list_templates))
        .route("/api/v1/templates/:id", get(get_template))
        .route("/api/v1/labs", post(create_lab))
        .route("/api/v1/labs/current", get(current_lab).delete(delete_lab))
        .route("/api/v1/pods/:namespace/:pod/status", get(pod_status))
        .route("/api/v1/pods/:namespace/:pod/validate", post(validate_task))
        .route("/api/v1/pods/:namespace/:pod/validate-lab", post(validate_lab))
        .route("/ws/terminal/:namespace/:pod", get(terminal))
        .route("/ws/terminal/:namespace/:pod/:container", get(terminal_container))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on `port` until `shutdown` completes.
pub async fn run_server<F>(port: u16, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "OK"
}

async fn list_templates(State(state): State<AppState>) -> Json<TemplateList> {
    let templates = state
        .catalog
        .list()
        .await
        .iter()
        .map(|t| LabTemplate::clone(t))
        .collect();
    Json(TemplateList { templates })
}

async fn get_template(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<LabTemplate> {
    let template = state
        .catalog
        .get(&id)
        .await
        .ok_or(LabError::TemplateNotFound(id))?;
    Ok(Json(LabTemplate::clone(&template)))
}

async fn create_lab(
    State(state): State<AppState>,
    caller: CallerId,
    Json(req): Json<CreateLabRequest>,
) -> ApiResult<CreateLabResponse> {
    let entry = state
        .provisioner
        .provision(caller.as_str(), &req.template_id)
        .await?;
    Ok(Json(CreateLabResponse {
        user_id: caller.0,
        template_id: entry.template_id,
        namespace: entry.namespace,
        pod_name: entry.workload,
        message: "Laboratório criado com sucesso",
    }))
}

async fn current_lab(State(state): State<AppState>, caller: CallerId) -> ApiResult<CurrentLab> {
    let info = state
        .provisioner
        .current_sandbox(caller.as_str())
        .await?
        .ok_or_else(|| LabError::SandboxNotFound(caller.0.clone()))?;
    let template = state.catalog.get(&info.template_id).await;
    Ok(Json(CurrentLab {
        title: template.as_ref().map(|t| t.title.clone()).unwrap_or_default(),
        tasks: template.map(|t| t.tasks.clone()).unwrap_or_default(),
        info,
    }))
}

async fn delete_lab(
    State(state): State<AppState>,
    caller: CallerId,
    Query(params): Query<TeardownParams>,
) -> ApiResult<serde_json::Value> {
    state
        .provisioner
        .teardown(caller.as_str(), params.force)
        .await?;
    Ok(Json(json!({ "message": "Laboratório encerrado com sucesso" })))
}

async fn pod_status(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    let pod = state
        .provisioner
        .workload_status(&SandboxRef::new(namespace, pod))
        .await?;
    let status = pod.status.clone().unwrap_or_default();
    Ok(Json(json!({
        "status": pod.phase(),
        "ready": pod.all_containers_ready(),
        "startTime": status.start_time,
        "containerStatuses": status.container_statuses,
    })))
}

async fn validate_task(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    Json(req): Json<ValidateTaskRequest>,
) -> ApiResult<crate::validation::Verdict> {
    let verdict = state
        .validation
        .validate_task_at(&SandboxRef::new(namespace, pod), &req.template_id, req.task_index)
        .await?;
    Ok(Json(verdict))
}

async fn validate_lab(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    Json(req): Json<ValidateLabRequest>,
) -> ApiResult<crate::validation::Verdict> {
    let verdict = state
        .validation
        .validate_lab(&SandboxRef::new(namespace, pod), &req.template_id)
        .await?;
    Ok(Json(verdict))
}

async fn terminal(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    attach(state, SandboxRef::new(namespace, pod), ws)
}

async fn terminal_container(
    State(state): State<AppState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    attach(state, SandboxRef::new(namespace, pod).with_container(container), ws)
}

fn attach(state: AppState, target: SandboxRef, ws: WebSocketUpgrade) -> Response {
    info!(sandbox = %target, "Terminal connection requested");
    let bridge = state.terminal.clone();
    ws.on_upgrade(move |socket| async move {
        bridge.serve(target, socket).await;
    })
}
