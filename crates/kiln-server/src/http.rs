//! HTTP control API over the lifecycle controller and admission queue.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /sandboxes` - List sandboxes
//! - `POST /sandboxes` - Build a sandbox (`?async=true` queues it and answers 202)
//! - `GET /sandboxes/:id` - Sandbox record
//! - `DELETE /sandboxes/:id` - Destroy a sandbox
//! - `GET /jobs/:id` - Queued build
//! - `DELETE /jobs/:id` - Cancel a queued build
//! - `GET /queue` - Queue statistics and jobs
//! - `POST /workspaces/:id/prebuild` - Start a prebuild
//! - `DELETE /workspaces/:id/prebuild` - Delete a prebuild

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use kiln_core::{
    AdmissionQueue, BuildHandler, CoreError, CreateSandboxRequest, Job, LifecycleController,
    PrebuildRunner, QueueConfig, Sandbox, SandboxId,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Number of finished jobs listed by `GET /queue`.
const RECENT_JOBS: usize = 20;

/// Shared handles of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<LifecycleController>,
    pub queue: Arc<AdmissionQueue>,
    pub prebuilds: Arc<PrebuildRunner>,
}

impl AppState {
    /// Wire the queue and the prebuild runner to `controller`.
    pub fn new(controller: Arc<LifecycleController>, queue: QueueConfig) -> Self {
        let handler: Arc<dyn BuildHandler> = controller.clone();
        Self {
            queue: Arc::new(AdmissionQueue::new(handler, queue)),
            prebuilds: Arc::new(PrebuildRunner::new(Arc::clone(&controller))),
            controller,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// A [`CoreError`] rendered as a JSON `{ "error": ... }` response.
#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

/// HTTP status for a provisioning error.
pub fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::InvalidState { .. } => StatusCode::CONFLICT,
        CoreError::ResourceExhausted { .. } | CoreError::Timeout(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, %status, "Request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "Request rejected");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_sandbox_id(raw: &str) -> ApiResult<SandboxId> {
    raw.parse().map_err(|_| {
        ApiError(CoreError::NotFound {
            kind: "sandbox",
            id: raw.to_string(),
        })
    })
}

fn parse_job_id(raw: &str) -> ApiResult<Uuid> {
    raw.parse().map_err(|_| {
        ApiError(CoreError::NotFound {
            kind: "job",
            id: raw.to_string(),
        })
    })
}

// ============================================================================
// Router
// ============================================================================

/// Build the HTTP router.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(state: AppState) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/health", get(health_handler))
        .route("/sandboxes", get(list_sandboxes).post(create_sandbox))
        .route("/sandboxes/:id", get(get_sandbox).delete(destroy_sandbox))
        .route("/jobs/:id", get(get_job).delete(cancel_job))
        .route("/queue", get(queue_handler))
        .route(
            "/workspaces/:id/prebuild",
            post(start_prebuild).delete(delete_prebuild),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    let mode = match state.controller.services().config.mode {
        kiln_core::RuntimeMode::Production => "production",
        kiln_core::RuntimeMode::Synthetic => "synthetic",
    };
    Json(json!({
        "status": "healthy",
        "service": "kiln-server",
        "mode": mode,
    }))
}

// ============================================================================
// Sandboxes
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct CreateParams {
    #[serde(rename = "async", default)]
    run_async: bool,
}

enum Created {
    Sandbox(Sandbox),
    Queued(Job),
}

impl IntoResponse for Created {
    fn into_response(self) -> Response {
        match self {
            Self::Sandbox(sandbox) => (StatusCode::CREATED, Json(sandbox)).into_response(),
            Self::Queued(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        }
    }
}

async fn create_sandbox(
    State(state): State<AppState>,
    Query(params): Query<CreateParams>,
    Json(request): Json<CreateSandboxRequest>,
) -> ApiResult<Created> {
    if params.run_async {
        let job = state.queue.enqueue(request).await;
        return Ok(Created::Queued(job));
    }
    let sandbox = state.queue.run_inline(request).await?;
    Ok(Created::Sandbox(sandbox))
}

async fn list_sandboxes(State(state): State<AppState>) -> ApiResult<Json<Vec<Sandbox>>> {
    Ok(Json(state.controller.list().await?))
}

async fn get_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Sandbox>> {
    let id = parse_sandbox_id(&id)?;
    Ok(Json(state.controller.get(&id).await?))
}

async fn destroy_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_sandbox_id(&id)?;
    state.controller.destroy(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Jobs and queue
// ============================================================================

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    let id = parse_job_id(&id)?;
    state
        .queue
        .get_job(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError(CoreError::NotFound {
            kind: "job",
            id: id.to_string(),
        }))
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.queue.cancel(id).await?))
}

async fn queue_handler(State(state): State<AppState>) -> Json<Value> {
    let queue = &state.queue;
    Json(json!({
        "stats": queue.stats().await,
        "queued": queue.queued_jobs().await,
        "running": queue.running_jobs().await,
        "recent": queue.recent_jobs(RECENT_JOBS).await,
    }))
}

// ============================================================================
// Prebuilds
// ============================================================================

async fn start_prebuild(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state.prebuilds.start(&workspace_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "workspaceId": workspace_id, "status": "building" })),
    ))
}

async fn delete_prebuild(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.prebuilds.delete(&workspace_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
