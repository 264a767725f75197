use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use futures::StreamExt;
use sandbox_studio_agent_schema::AgentMessage;
use sandbox_studio_error::{ErrorType, ProblemDetails, SandboxError};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Span};
use utoipa::{Modify, OpenApi, ToSchema};

use crate::broadcaster::{
    BroadcastReport, Connection, FileChangeBroadcaster, FileChangeEvent, FileChangeKind,
};
use crate::checkpoint::{BundleResult, Commit, CreateCommitResult, PublishedAsset};
use crate::executor::{RunContext, RunOutcome, RunState};
use crate::hooks::{HookOutcome, HookResult, HooksExecutionResult};
use crate::projects::Project;
use crate::run_spec::{resolve_request, RunRequest};
use crate::sandbox::{Liveness, PauseOutcome, SandboxHandle};
use crate::services::StudioServices;

/// Frames buffered per event-stream connection before it counts as stalled.
const EVENT_STREAM_BUFFER: usize = 64;

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    services: Arc<StudioServices>,
}

impl AppState {
    pub fn new(auth: AuthConfig, services: StudioServices) -> Self {
        Self::with_services(auth, Arc::new(services))
    }

    pub fn with_services(auth: AuthConfig, services: Arc<StudioServices>) -> Self {
        Self { auth, services }
    }

    pub fn services(&self) -> Arc<StudioServices> {
        self.services.clone()
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/projects", post(register_project))
        .route("/projects/:project_id/runs", post(trigger_run))
        .route("/projects/:project_id/events", get(project_events))
        .route("/projects/:project_id/file-changes", post(publish_file_change))
        .route(
            "/projects/:project_id/versions",
            get(list_versions).post(create_version),
        )
        .route("/projects/:project_id/restore", post(restore_version))
        .route("/projects/:project_id/bundle", post(build_bundle))
        .route("/projects/:project_id/assets", get(list_assets))
        .route(
            "/bundles/:project_id/:commit_id/*file_path",
            get(legacy_bundle_redirect),
        )
        .route("/sandboxes/:sandbox_id/alive", get(sandbox_alive))
        .route("/sandboxes/:sandbox_id/pause", post(pause_sandbox))
        .route("/sandboxes/:sandbox_id/resume", post(resume_sandbox))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        v1_router = v1_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let router = Router::new().nest("/v1", v1_router).fallback(not_found);
    (with_http_logging(router), shared)
}

/// Headers whose values never reach the logs.
const REDACTED_HEADERS: [&str; 3] = ["authorization", "cookie", "x-api-key"];

/// Request spans are on unless `SANDBOX_STUDIO_LOG_HTTP` is `0`, `false` or
/// `off`. `SANDBOX_STUDIO_LOG_HTTP_HEADERS` adds the redacted request headers.
fn with_http_logging(router: Router) -> Router {
    let enabled = std::env::var("SANDBOX_STUDIO_LOG_HTTP")
        .map(|value| !matches!(value.to_ascii_lowercase().as_str(), "0" | "false" | "off"))
        .unwrap_or(true);
    if !enabled {
        return router;
    }
    let log_headers = std::env::var_os("SANDBOX_STUDIO_LOG_HTTP_HEADERS").is_some();
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(move |req: &Request<_>| {
                let span = info_span!(
                    "studio.http",
                    method = %req.method(),
                    path = %req.uri().path(),
                    headers = tracing::field::Empty
                );
                if log_headers {
                    span.record("headers", tracing::field::debug(redacted_headers(req.headers())));
                }
                span
            })
            .on_response(|res: &Response<_>, latency: Duration, _span: &Span| {
                info!(status = res.status().as_u16(), latency_ms = latency.as_millis() as u64, "served");
            }),
    )
}

fn redacted_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = if REDACTED_HEADERS.contains(&name.as_str()) {
                "<redacted>"
            } else {
                value.to_str().unwrap_or("<binary>")
            };
            (name.as_str().to_string(), shown.to_string())
        })
        .collect()
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        register_project,
        trigger_run,
        project_events,
        publish_file_change,
        list_versions,
        create_version,
        restore_version,
        build_bundle,
        list_assets,
        legacy_bundle_redirect,
        sandbox_alive,
        pause_sandbox,
        resume_sandbox
    ),
    components(
        schemas(
            ProblemDetails,
            ErrorType,
            HealthResponse,
            RegisterProjectRequest,
            Project,
            RunTriggerRequest,
            RunRequest,
            RunOutcome,
            RunState,
            AgentMessage,
            HooksExecutionResult,
            HookResult,
            HookOutcome,
            FileChangeRequest,
            FileChangeKind,
            BroadcastReport,
            VersionsResponse,
            VersionEntry,
            CreateVersionRequest,
            CreateCommitResult,
            Commit,
            BundleResult,
            RestoreRequest,
            RestoreResponse,
            BundleRequest,
            AssetsResponse,
            PublishedAsset,
            Liveness,
            PauseOutcome,
            ResumeResponse
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "projects", description = "Projects and agent runs"),
        (name = "versions", description = "Checkpoints, restore and bundles"),
        (name = "sandboxes", description = "Sandbox lifecycle")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2470")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Sandbox(err) => {
                if !err.is_user_facing() {
                    warn!(error = %err, "request failed");
                }
                err.to_problem_details()
            }
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterProjectRequest {
    pub project_id: String,
    pub user_id: String,
    pub sandbox_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunTriggerRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub run: RunRequest,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: FileChangeKind,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub id: String,
    pub message: String,
    /// RFC 3339.
    pub timestamp: String,
    /// Git commit sha.
    pub commit_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionsResponse {
    pub versions: Vec<VersionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateVersionRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, rename = "commitSHA")]
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssetsResponse {
    pub assets: Vec<PublishedAsset>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub sandbox_id: String,
    pub working_dir: String,
}

fn require_field(field: &str, value: Option<String>) -> Result<String, SandboxError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SandboxError::validation(field, "is required"))
}

fn rfc3339(unix_ms: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(unix_ms) * 1_000_000)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_default()
}

async fn project_sandbox(state: &AppState, project: &Project) -> Result<SandboxHandle, SandboxError> {
    Ok(state
        .services
        .sessions
        .connect(&project.sandbox_id)
        .await?
        .with_working_dir(&project.working_dir))
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, description = "Server is healthy", body = HealthResponse)),
    tag = "meta"
)]
/// Health Check
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/v1/projects",
    request_body = RegisterProjectRequest,
    responses(
        (status = 200, description = "Project registered", body = Project),
        (status = 400, body = ProblemDetails)
    ),
    tag = "projects"
)]
/// Register Project
///
/// Binds a project to its owner and sandbox.
async fn register_project(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    let working_dir = request
        .working_dir
        .filter(|dir| !dir.trim().is_empty())
        .unwrap_or_else(|| state.services.resolver.cwd.clone());
    if !working_dir.starts_with('/') {
        return Err(SandboxError::validation("workingDir", "must be an absolute path").into());
    }
    if request.sandbox_id.trim().is_empty() {
        return Err(SandboxError::validation("sandboxId", "is required").into());
    }
    let project = state.services.projects.register(Project {
        project_id: request.project_id,
        owner_id: request.user_id,
        sandbox_id: request.sandbox_id,
        working_dir,
    })?;
    Ok(Json(project))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{project_id}/runs",
    params(("project_id" = String, Path, description = "Project id")),
    request_body = RunTriggerRequest,
    responses(
        (status = 200, description = "Run finished", body = RunOutcome),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "projects"
)]
/// Trigger Run
///
/// Runs the agent to completion and returns every message it produced.
/// Disconnecting cancels the run.
async fn trigger_run(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(request): Json<RunTriggerRequest>,
) -> Result<(StatusCode, Json<RunOutcome>), ApiError> {
    let user_id = require_field("userId", request.user_id)?;
    let project = state.services.projects.authorize(&project_id, &user_id)?;
    let spec = resolve_request(&request.run, &state.services.resolver)?;
    let hooks = state.services.hooks_for(&spec)?;
    let ctx = RunContext {
        run_id: state.services.next_run_id(),
        project_id: project.project_id,
        sandbox_id: project.sandbox_id,
        working_dir: project.working_dir,
        spec,
        hooks,
    };

    let executor = state.services.executor.clone();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let outcome = tokio::spawn(async move { executor.run(ctx, cancel, None).await })
        .await
        .map_err(|err| SandboxError::internal(format!("run task failed: {err}")))?;
    guard.disarm();

    let status =
        StatusCode::from_u16(outcome.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(outcome)))
}

/// Removes an event-stream connection once its response body is dropped.
struct ConnectionGuard {
    broadcaster: Arc<FileChangeBroadcaster>,
    project_id: String,
    connection_id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self
            .broadcaster
            .remove_connection(&self.project_id, self.connection_id)
        {
            debug!(project_id = %self.project_id, connection_id = self.connection_id, "event stream closed");
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/projects/{project_id}/events",
    params(
        ("project_id" = String, Path, description = "Project id"),
        ("userId" = String, Query, description = "Project owner")
    ),
    responses(
        (status = 200, description = "File change event stream", content_type = "text/event-stream"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "projects"
)]
/// Subscribe to File Changes
///
/// The first frame is always `connected`.
async fn project_events(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Response, ApiError> {
    let user_id = require_field("userId", query.user_id)?;
    let project = state.services.projects.authorize(&project_id, &user_id)?;

    let broadcaster = state.services.broadcaster.clone();
    let (connection, frames) = broadcaster.open_sse(EVENT_STREAM_BUFFER);
    let guard = ConnectionGuard {
        broadcaster: broadcaster.clone(),
        project_id: project.project_id.clone(),
        connection_id: connection.id(),
    };
    broadcaster.add_connection(&project.project_id, connection);

    let body = ReceiverStream::new(frames).map(move |frame| {
        let _guard = &guard;
        Ok::<_, Infallible>(frame)
    });
    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/projects/{project_id}/file-changes",
    params(("project_id" = String, Path, description = "Project id")),
    request_body = FileChangeRequest,
    responses(
        (status = 200, description = "Event broadcast", body = BroadcastReport),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "projects"
)]
/// Publish File Change
async fn publish_file_change(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(request): Json<FileChangeRequest>,
) -> Result<Json<BroadcastReport>, ApiError> {
    let user_id = require_field("userId", request.user_id)?;
    let project = state.services.projects.authorize(&project_id, &user_id)?;
    if request.kind == FileChangeKind::Connected {
        return Err(SandboxError::validation("type", "connected is reserved").into());
    }
    let event = FileChangeEvent::new(&project.project_id, request.kind, request.path);
    let report = state
        .services
        .broadcaster
        .broadcast(&project.project_id, &event);
    Ok(Json(report))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{project_id}/versions",
    params(
        ("project_id" = String, Path, description = "Project id"),
        ("userId" = String, Query, description = "Project owner"),
        ("limit" = Option<usize>, Query, description = "Maximum versions; capped server-side")
    ),
    responses(
        (status = 200, description = "Versions, newest first", body = VersionsResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "versions"
)]
/// List Versions
async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<VersionsResponse>, ApiError> {
    let user_id = require_field("userId", query.user_id)?;
    let project = state.services.projects.authorize(&project_id, &user_id)?;
    let commits = state
        .services
        .checkpoints
        .list_commits(&project.project_id, query.limit)
        .await?;
    let versions = commits
        .into_iter()
        .map(|commit| VersionEntry {
            timestamp: rfc3339(commit.created_at),
            id: commit.id,
            message: commit.user_message,
            commit_id: commit.github_sha,
            bundle_url: commit.bundle_url,
        })
        .collect();
    Ok(Json(VersionsResponse { versions }))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{project_id}/versions",
    params(("project_id" = String, Path, description = "Project id")),
    request_body = CreateVersionRequest,
    responses(
        (status = 200, description = "Commit created", body = CreateCommitResult),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "versions"
)]
/// Create Version
async fn create_version(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(request): Json<CreateVersionRequest>,
) -> Result<Json<CreateCommitResult>, ApiError> {
    let user_id = require_field("userId", request.user_id)?;
    let message = require_field("message", request.message)?;
    let project = state.services.projects.authorize(&project_id, &user_id)?;
    let sandbox = project_sandbox(&state, &project).await?;
    let result = state
        .services
        .checkpoints
        .create_commit(&project.project_id, &sandbox, &message)
        .await?;
    Ok(Json(result))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{project_id}/restore",
    params(("project_id" = String, Path, description = "Project id")),
    request_body = RestoreRequest,
    responses(
        (status = 200, description = "Working tree restored", body = RestoreResponse),
        (status = 400, description = "Missing field", body = RestoreResponse),
        (status = 404, description = "Unknown or foreign commit", body = RestoreResponse),
        (status = 500, body = RestoreResponse)
    ),
    tag = "versions"
)]
/// Restore Version
///
/// Discards uncommitted changes and checks out the commit.
async fn restore_version(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> (StatusCode, Json<RestoreResponse>) {
    match restore(&state, &project_id, request).await {
        Ok(()) => (
            StatusCode::OK,
            Json(RestoreResponse {
                success: true,
                error: None,
                details: None,
            }),
        ),
        Err(err) => {
            if !err.is_user_facing() {
                warn!(project_id = %project_id, error = %err, "restore failed");
            }
            let problem = err.to_problem_details();
            let status = StatusCode::from_u16(problem.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(RestoreResponse {
                    success: false,
                    error: Some(problem.title),
                    details: Some(problem.detail),
                }),
            )
        }
    }
}

async fn restore(state: &AppState, project_id: &str, request: RestoreRequest) -> Result<(), SandboxError> {
    let user_id = require_field("userId", request.user_id)?;
    let sha = require_field("commitSHA", request.commit_sha)?;
    let project = state.services.projects.authorize(project_id, &user_id)?;
    let sandbox = project_sandbox(state, &project).await?;
    state
        .services
        .checkpoints
        .restore_commit(&project.project_id, &sandbox, &sha)
        .await?;
    Ok(())
}

#[utoipa::path(
    post,
    path = "/v1/projects/{project_id}/bundle",
    params(("project_id" = String, Path, description = "Project id")),
    request_body = BundleRequest,
    responses(
        (status = 200, description = "Bundle published", body = BundleResult),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "versions"
)]
/// Build Bundle
///
/// Builds and publishes the sandbox's current commit.
async fn build_bundle(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(request): Json<BundleRequest>,
) -> Result<Json<BundleResult>, ApiError> {
    let user_id = require_field("userId", request.user_id)?;
    let project = state.services.projects.authorize(&project_id, &user_id)?;
    let sandbox = project_sandbox(&state, &project).await?;
    let bundle = state
        .services
        .checkpoints
        .build_current_bundle(&sandbox, &project.project_id, request.note.as_deref())
        .await?;
    Ok(Json(bundle))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{project_id}/assets",
    params(
        ("project_id" = String, Path, description = "Project id"),
        ("userId" = String, Query, description = "Project owner")
    ),
    responses(
        (status = 200, description = "Published assets", body = AssetsResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "versions"
)]
/// List Published Assets
async fn list_assets(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<Json<AssetsResponse>, ApiError> {
    let user_id = require_field("userId", query.user_id)?;
    let project = state.services.projects.authorize(&project_id, &user_id)?;
    let sandbox = project_sandbox(&state, &project).await?;
    let assets = state.services.checkpoints.published_assets(&sandbox).await?;
    Ok(Json(AssetsResponse { assets }))
}

#[utoipa::path(
    get,
    path = "/v1/bundles/{project_id}/{commit_id}/{file_path}",
    params(
        ("project_id" = String, Path, description = "Project id"),
        ("commit_id" = String, Path, description = "Commit id or sha"),
        ("file_path" = String, Path, description = "Path inside the bundle")
    ),
    responses(
        (status = 307, description = "Redirect to the published file"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "versions"
)]
/// Legacy Bundle File
async fn legacy_bundle_redirect(
    State(state): State<Arc<AppState>>,
    Path((project_id, commit_id, file_path)): Path<(String, String, String)>,
) -> Result<Redirect, ApiError> {
    let url = state
        .services
        .checkpoints
        .bundle_redirect(&project_id, &commit_id, &file_path)
        .await?;
    Ok(Redirect::temporary(&url))
}

#[utoipa::path(
    get,
    path = "/v1/sandboxes/{sandbox_id}/alive",
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    responses((status = 200, description = "Liveness probe", body = Liveness)),
    tag = "sandboxes"
)]
/// Sandbox Liveness
async fn sandbox_alive(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Json<Liveness> {
    Json(state.services.sessions.check_alive(&sandbox_id).await)
}

#[utoipa::path(
    post,
    path = "/v1/sandboxes/{sandbox_id}/pause",
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    responses(
        (status = 200, description = "Sandbox paused", body = PauseOutcome),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
/// Pause Sandbox
///
/// Projects bound to the sandbox follow it to its new id.
async fn pause_sandbox(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<PauseOutcome>, ApiError> {
    let outcome = state.services.sessions.pause_id(&sandbox_id).await?;
    if outcome.sandbox_id != sandbox_id {
        state
            .services
            .projects
            .replace_sandbox(&sandbox_id, &outcome.sandbox_id);
    }
    Ok(Json(outcome))
}

#[utoipa::path(
    post,
    path = "/v1/sandboxes/{sandbox_id}/resume",
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    responses(
        (status = 200, description = "Sandbox resumed", body = ResumeResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
/// Resume Sandbox
async fn resume_sandbox(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<ResumeResponse>, ApiError> {
    let handle = state.services.sessions.resume(&sandbox_id).await?;
    Ok(Json(ResumeResponse {
        sandbox_id: handle.id,
        working_dir: handle.working_dir,
    }))
}

async fn not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "404 Not Found".to_string())
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();
    if path == "/v1/health" || path == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(SandboxError::token_invalid("missing or invalid token").into())
    }
}

/// Bearer token, or the password half of Basic credentials.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credentials) = value.trim().split_once(char::is_whitespace)?;
    let credentials = credentials.trim();
    let token = if scheme.eq_ignore_ascii_case("bearer") {
        credentials.to_string()
    } else if scheme.eq_ignore_ascii_case("basic") {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(credentials)
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        match decoded.split_once(':') {
            Some((_, password)) => password.to_string(),
            None => decoded,
        }
    } else {
        return None;
    };
    (!token.is_empty()).then_some(token)
}
