//! HTTP router and handlers
//!
//! The transport half of the dispatcher contract: resolves the caller's
//! owner id from its bearer token, forwards to the dispatcher, and maps the
//! dispatcher's error kinds onto HTTP statuses.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::identity::WorkerType;
use crate::registry::{WorkerFilter, WorkerStatus};
use crate::task::{SubmitRequest, TaskMode};
use crate::Error;

use super::ws::worker_ws_handler;

/// Shared application state
pub struct AppState {
    /// The dispatcher core
    pub dispatcher: Arc<Dispatcher>,
    /// Full configuration (auth token map, server knobs)
    pub config: Arc<Config>,
}

/// Owner id resolved by the auth middleware
#[derive(Debug, Clone)]
pub struct CallerOwner(pub String);

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth_state = Arc::clone(&state);

    Router::new()
        .route("/api/tasks", post(submit_task_handler))
        .route("/api/tasks/{task_id}", get(get_task_handler))
        .route("/api/tasks/{task_id}/cancel", post(cancel_task_handler))
        .route("/api/echo", post(echo_handler))
        .route("/api/workers", get(list_workers_handler))
        .route("/api/workers/mine", get(list_my_workers_handler))
        .route("/api/workers/stats", get(worker_stats_handler))
        .route("/api/workers/{node_id}", delete(drop_worker_handler))
        .route("/api/inflight", get(inflight_handler))
        .route("/api/worker-identities", post(create_identity_handler))
        .route(
            "/api/worker-identities/{node_id}",
            delete(remove_identity_handler),
        )
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
        // Worker channel and liveness probe bypass caller auth: workers
        // authenticate inside the hello frame instead.
        .route("/ws/worker", get(worker_ws_handler))
        .route("/healthz", get(health_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the caller's owner id from the Authorization header
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match state.config.resolve_owner(bearer) {
        Some(owner_id) => {
            request.extensions_mut().insert(CallerOwner(owner_id));
            next.run(request).await
        }
        None => {
            warn!("Rejected caller with missing or unknown token");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "unauthenticated"})),
            )
                .into_response()
        }
    }
}

/// Map a dispatcher error kind onto an HTTP status
fn status_for(err: &Error) -> StatusCode {
    match err.kind() {
        "no_worker" | "no_capacity" | "no_echo_worker" => StatusCode::SERVICE_UNAVAILABLE,
        "request_in_progress" | "terminal" | "session_busy" => StatusCode::CONFLICT,
        "not_found" | "session_not_found" => StatusCode::NOT_FOUND,
        "invalid_payload" => StatusCode::BAD_REQUEST,
        "deadline_exceeded" | "task_timeout" | "echo_timeout" => StatusCode::GATEWAY_TIMEOUT,
        "unauthenticated" => StatusCode::UNAUTHORIZED,
        "internal" | "io" | "config" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(err: &Error) -> Response {
    (
        status_for(err),
        Json(json!({
            "error": err.kind(),
            "message": err.to_string(),
        })),
    )
        .into_response()
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitTaskBody {
    capability: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    mode: TaskMode,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    request_id: Option<String>,
}

async fn submit_task_handler(
    State(state): State<Arc<AppState>>,
    axum::Extension(owner): axum::Extension<CallerOwner>,
    Json(body): Json<SubmitTaskBody>,
) -> Response {
    let request = SubmitRequest {
        capability: body.capability,
        input: body.input,
        mode: body.mode,
        timeout: body.timeout_ms.map(Duration::from_millis),
        request_id: body.request_id,
        owner_id: owner.0,
    };
    match state.dispatcher.submit_task(request).await {
        Ok(result) => {
            let status = if result.completed {
                StatusCode::OK
            } else {
                StatusCode::ACCEPTED
            };
            (
                status,
                Json(json!({
                    "task": result.task,
                    "completed": result.completed,
                })),
            )
                .into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn get_task_handler(
    State(state): State<Arc<AppState>>,
    axum::Extension(owner): axum::Extension<CallerOwner>,
    Path(task_id): Path<String>,
) -> Response {
    match state.dispatcher.get_task(&task_id, &owner.0) {
        Some(task) => Json(json!({ "task": task })).into_response(),
        None => error_response(&Error::NotFound(task_id)),
    }
}

async fn cancel_task_handler(
    State(state): State<Arc<AppState>>,
    axum::Extension(owner): axum::Extension<CallerOwner>,
    Path(task_id): Path<String>,
) -> Response {
    match state.dispatcher.cancel_task(&task_id, &owner.0) {
        Ok(result) => {
            // Cancel of an already-terminal task reports the snapshot with
            // conflict semantics.
            let status = if result.already_terminal {
                StatusCode::CONFLICT
            } else {
                StatusCode::OK
            };
            (
                status,
                Json(json!({
                    "task": result.task,
                    "already_terminal": result.already_terminal,
                })),
            )
                .into_response()
        }
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct EchoBody {
    message: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn echo_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EchoBody>,
) -> Response {
    match state
        .dispatcher
        .dispatch_echo(&body.message, body.timeout_ms.map(Duration::from_millis))
        .await
    {
        Ok(message) => Json(json!({ "message": message })).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct ListWorkersQuery {
    #[serde(default)]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
    #[serde(default)]
    capability: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    worker_type: Option<String>,
}

fn default_page_size() -> usize {
    50
}

impl ListWorkersQuery {
    fn filter(&self) -> WorkerFilter {
        WorkerFilter {
            capability: self.capability.clone(),
            status: self.status.as_deref().map(|s| {
                if s.eq_ignore_ascii_case("offline") {
                    WorkerStatus::Offline
                } else {
                    WorkerStatus::Online
                }
            }),
        }
    }
}

async fn list_workers_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListWorkersQuery>,
) -> Response {
    let (workers, total) =
        state
            .dispatcher
            .list_workers(&query.filter(), query.page, query.page_size);
    Json(json!({ "workers": workers, "total": total })).into_response()
}

async fn list_my_workers_handler(
    State(state): State<Arc<AppState>>,
    axum::Extension(owner): axum::Extension<CallerOwner>,
    Query(query): Query<ListWorkersQuery>,
) -> Response {
    let worker_type = query
        .worker_type
        .as_deref()
        .map_or(WorkerType::Normal, WorkerType::from_label);
    let (workers, total) = state.dispatcher.list_workers_scoped(
        &query.filter(),
        query.page,
        query.page_size,
        &owner.0,
        worker_type,
    );
    Json(json!({ "workers": workers, "total": total })).into_response()
}

async fn worker_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!(state.dispatcher.registry_stats())).into_response()
}

async fn drop_worker_handler(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> Response {
    state.dispatcher.drop_worker(&node_id);
    StatusCode::NO_CONTENT.into_response()
}

async fn inflight_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "workers": state.dispatcher.inflight_stats() })).into_response()
}

#[derive(Debug, Deserialize)]
struct CreateIdentityBody {
    node_id: String,
    #[serde(default)]
    worker_type: Option<String>,
}

async fn create_identity_handler(
    State(state): State<Arc<AppState>>,
    axum::Extension(owner): axum::Extension<CallerOwner>,
    Json(body): Json<CreateIdentityBody>,
) -> Response {
    let worker_type = body
        .worker_type
        .as_deref()
        .map_or(WorkerType::Normal, WorkerType::from_label);

    match state
        .dispatcher
        .verifier()
        .create(&body.node_id, &owner.0, worker_type)
        .await
    {
        Ok(secret) => {
            debug!(node_id = %body.node_id, "Issued worker identity");
            // The plaintext secret appears in this response exactly once.
            (
                StatusCode::CREATED,
                Json(json!({
                    "node_id": body.node_id,
                    "worker_secret": secret,
                })),
            )
                .into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn remove_identity_handler(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> Response {
    match state.dispatcher.verifier().remove(&node_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(&Error::NotFound(node_id)),
        Err(err) => error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_the_taxonomy() {
        assert_eq!(
            status_for(&Error::NoWorker("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::RequestInProgress("r".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::NotFound("t".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::Terminal("t".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::worker("invalid_payload", "bad json")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::worker("session_busy", "busy")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::worker("python_error", "traceback")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&Error::DeadlineExceeded),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(&Error::EchoTimeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&Error::Unauthenticated),
            StatusCode::UNAUTHORIZED
        );
    }
}
