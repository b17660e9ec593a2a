//! HTTP API for project transitions, one-shot commands and peer passthrough.
//!
//! Provides:
//! - `/health` - agent identity and liveness
//! - `/projects` - reconciled registry
//! - `/projects/{name}/activate`, `/deactivate` - state-machine transitions
//! - `/projects/{name}/open-studio` - launch the IDE on a project
//! - `/projects/{name}/forget` - drop a registry entry
//! - `/command` - run one command and capture its output
//! - `/projects/ide`, `/projects/ide/close` - forwarded to the peer
//! - `/ws/terminal` - interactive sessions (authenticated at handshake)
//!
//! Every route is served both at the root and under `/api`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use omni_common::{AgentError, ProjectRecord, validate_project_name};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

use crate::activation::{self, TransitionReport};
use crate::auth::require_token;
use crate::command::run_once;
use crate::context::AgentContext;
use crate::{studio, ws};

const APP_NAME: &str = "OmniProjectSync Remote Agent";

/// Error body: `{"status":"error","code":..,"message":..}`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    /// Transition endpoints answer 400 for every failure but keep the kind.
    fn bad_request(err: AgentError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self {
            status: StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "status": "error",
                "code": self.code,
                "message": self.message,
            })),
        )
            .into_response()
    }
}

/// Build the full router. Everything but the streaming endpoint sits behind
/// the Auth Gate middleware; the streaming endpoint checks the token itself.
pub fn create_router(ctx: Arc<AgentContext>) -> Router {
    let routes = Router::new()
        .route("/health", get(health_handler))
        .route("/projects", get(projects_handler))
        .route("/projects/ide", get(ide_projects_handler))
        .route("/projects/ide/close", post(ide_close_handler))
        .route("/projects/{name}/activate", post(activate_handler))
        .route("/projects/{name}/deactivate", post(deactivate_handler))
        .route("/projects/{name}/open-studio", post(open_studio_handler))
        .route("/projects/{name}/forget", post(forget_handler))
        .route("/command", post(command_handler))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), require_token))
        .route("/ws/terminal", get(ws::ws_handler));

    Router::new()
        .merge(routes.clone())
        .nest("/api", routes)
        .with_state(ctx)
}

/// Handler for `/health`.
async fn health_handler(State(ctx): State<Arc<AgentContext>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "app": APP_NAME,
        "version": ctx.version,
        "time": Utc::now().to_rfc3339(),
        "pid": ctx.pid,
        "uptime_seconds": ctx.started_at.elapsed().as_secs(),
        "sessions": ctx.sessions.len(),
        "transitions": ctx.locks.busy(),
    }))
}

/// Handler for `/projects` - reconciled registry, hidden names filtered.
async fn projects_handler(
    State(ctx): State<Arc<AgentContext>>,
) -> Result<Json<Vec<ProjectRecord>>, ApiError> {
    let scan = ctx.clone();
    let records = tokio::task::spawn_blocking(move || scan.registry.records())
        .await
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: format!("registry scan aborted: {e}"),
        })??;
    Ok(Json(
        records
            .into_iter()
            .filter(|record| !ctx.config.projects.is_hidden(&record.name))
            .collect(),
    ))
}

fn transition_body(message: &str, report: TransitionReport) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": message,
        "report": report,
    }))
}

async fn activate_handler(
    State(ctx): State<Arc<AgentContext>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let report = activation::activate(ctx, name)
        .await
        .map_err(ApiError::bad_request)?;
    Ok(transition_body("Activated", report))
}

async fn deactivate_handler(
    State(ctx): State<Arc<AgentContext>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let report = activation::deactivate(ctx, name)
        .await
        .map_err(ApiError::bad_request)?;
    Ok(transition_body("Deactivated", report))
}

async fn open_studio_handler(
    State(ctx): State<Arc<AgentContext>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let path = studio::open_studio(&ctx, &name).map_err(ApiError::bad_request)?;
    Ok(Json(json!({
        "status": "ok",
        "message": "Opened",
        "path": path,
    })))
}

async fn forget_handler(
    State(ctx): State<Arc<AgentContext>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    validate_project_name(&name)?;
    let _lock = ctx.locks.try_acquire(&name)?;
    if !ctx.registry.forget(&name)? {
        return Err(AgentError::not_found("project", name).into());
    }
    info!(project = %name, "project forgotten");
    Ok(Json(json!({ "status": "ok", "message": "Forgotten" })))
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    cmd: String,
    #[serde(default)]
    cwd: Option<String>,
}

async fn command_handler(
    State(ctx): State<Arc<AgentContext>>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = run_once(&ctx, &request.cmd, request.cwd.as_deref()).await?;
    Ok(Json(json!({
        "status": "ok",
        "code": result.code,
        "output": result.output,
    })))
}

/// Handler for `/projects/ide` - the peer's list, or an empty one when the
/// peer cannot be reached.
async fn ide_projects_handler(State(ctx): State<Arc<AgentContext>>) -> Json<Value> {
    match ctx.peer.projects_raw().await {
        Ok(value) => Json(value),
        Err(e) => {
            warn!(error = %e, "peer project list unavailable");
            Json(json!({ "projects": [], "error": e.to_string() }))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CloseRequest {
    name: String,
}

async fn ide_close_handler(
    State(ctx): State<Arc<AgentContext>>,
    Json(request): Json<CloseRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(AgentError::InvalidRequest("name is required".to_string()).into());
    }
    ctx.peer.close_project(name).await.map(Json).map_err(|e| {
        warn!(project = %name, error = %e, "peer close failed");
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: e.code(),
            message: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{TEST_TOKEN, TestEnv};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router(env: &TestEnv) -> Router {
        create_router(Arc::new(env.context()))
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("X-Omni-Token", TEST_TOKEN)
            .body(Body::empty())
            .unwrap()
    }

    fn post_req(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("X-Omni-Token", TEST_TOKEN)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let env = TestEnv::new();
        let (status, json) = send(router(&env), get_req("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["app"], APP_NAME);
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["pid"], std::process::id());
        assert!(json["uptime_seconds"].is_u64());
        assert_eq!(json["sessions"], 0);
        assert_eq!(json["transitions"], json!([]));
    }

    #[tokio::test]
    async fn test_routes_are_served_under_api_prefix() {
        let env = TestEnv::new();
        let (status, json) = send(router(&env), get_req("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_or_wrong_token_is_unauthorized() {
        let env = TestEnv::new();

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(router(&env), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["status"], "error");
        assert_eq!(json["code"], "unauthorized");

        let request = Request::builder()
            .uri("/api/projects")
            .header("X-Omni-Token", TEST_TOKEN.to_uppercase())
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router(&env), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bearer_token_is_accepted() {
        let env = TestEnv::new();
        let request = Request::builder()
            .uri("/health")
            .header("Authorization", format!("Bearer {TEST_TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router(&env), request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_projects_are_sorted_and_hidden_names_filtered() {
        let env = TestEnv::new();
        for name in ["zeta", "alpha", "Secret"] {
            std::fs::create_dir(env.work().join(name)).unwrap();
        }
        std::fs::create_dir(env.backup().join("beta")).unwrap();
        let mut config = env.config();
        config.projects.hidden = vec!["secret".into()];
        let router = create_router(Arc::new(AgentContext::new(config).unwrap()));

        let (status, json) = send(router, get_req("/projects")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json,
            json!([
                {"name": "alpha", "status": "Local"},
                {"name": "beta", "status": "Cloud"},
                {"name": "zeta", "status": "Local"},
            ])
        );
    }

    #[tokio::test]
    async fn test_deactivate_then_activate_over_http() {
        let env = TestEnv::new();
        let project = env.work().join("demo");
        std::fs::create_dir(&project).unwrap();
        std::fs::write(project.join("main.py"), "print('hi')\n").unwrap();
        let router = router(&env);

        let (status, json) = send(router.clone(), post_req("/projects/demo/deactivate", json!({}))).await;
        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(json["message"], "Deactivated");
        assert_eq!(json["report"]["status"], "Cloud");
        assert!(!project.exists());

        let (status, json) = send(router.clone(), post_req("/api/projects/demo/activate", json!({}))).await;
        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(json["message"], "Activated");
        assert_eq!(
            std::fs::read_to_string(project.join("main.py")).unwrap(),
            "print('hi')\n"
        );

        let (status, json) = send(router, post_req("/projects/demo/activate", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_transition_failures_are_bad_requests_with_kind() {
        let env = TestEnv::new();
        std::fs::create_dir(env.work().join("demo")).unwrap();

        let (status, json) = send(router(&env), post_req("/projects/ghost/activate", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "not_found");

        let unconfigured = create_router(Arc::new(env.context_without_backup()));
        let (status, json) = send(unconfigured, post_req("/projects/demo/deactivate", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "not_configured");
        assert!(env.work().join("demo").is_dir());
    }

    #[tokio::test]
    async fn test_forget_drops_registry_entry() {
        let env = TestEnv::new();
        std::fs::create_dir(env.backup().join("old")).unwrap();
        let ctx = Arc::new(env.context());
        ctx.registry.records().unwrap();
        std::fs::remove_dir(env.backup().join("old")).unwrap();
        let router = create_router(ctx);

        let (status, json) = send(router.clone(), post_req("/projects/old/forget", json!({}))).await;
        assert_eq!(status, StatusCode::OK, "{json}");

        let (status, json) = send(router, post_req("/projects/old/forget", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "not_found");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_endpoint_captures_output() {
        let env = TestEnv::new();
        let (status, json) = send(
            router(&env),
            post_req("/command", json!({"cmd": "echo hi; echo oops 1>&2"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["code"], 0);
        assert_eq!(json["output"], "hi\n\noops\n");
    }

    #[tokio::test]
    async fn test_command_endpoint_rejects_unsafe_cwd() {
        let env = TestEnv::new();
        let outside = tempfile::TempDir::new().unwrap();
        let (status, json) = send(
            router(&env),
            post_req(
                "/command",
                json!({"cmd": "true", "cwd": outside.path().to_string_lossy()}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "unsafe_path");
    }

    #[tokio::test]
    async fn test_ide_projects_degrade_when_peer_is_unavailable() {
        let env = TestEnv::new();
        let (status, json) = send(router(&env), get_req("/projects/ide")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["projects"], json!([]));
        assert!(json["error"].is_string());

        let (status, json) = send(router(&env), post_req("/projects/ide/close", json!({"name": "demo"}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["code"], "relay_failure");
    }
}
