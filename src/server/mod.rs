//! Webhook transport.
//!
//! `POST /events` verifies the GitHub signature, maps the payload to an
//! engine event and hands it to [`Engine::submit`]; the response is sent
//! before the event is processed. `GET /status` lists held locks.

pub mod github_events;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::locking::FileLockManager;
use crate::policy::{PolicyGate, verify_signature};
use crate::project::FileRepoConfigLoader;
use crate::runner::{GitWorkingDir, ProcessToolInvoker, RunOrchestrator};
use crate::vcs::{GitHubClient, RetryPolicy, RetryingVcs};

pub use github_events::{WebhookEvent, parse_webhook};

const EVENT_HEADER: &str = "x-github-event";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

pub struct AppState {
    pub engine: Arc<Engine>,
    /// `None` accepts unsigned payloads.
    pub webhook_secret: Option<String>,
    pub hostname: String,
    /// Comments by this user are ignored.
    pub bot_user: Option<String>,
}

pub type SharedState = Arc<AppState>;

pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "request signature did not match".to_string(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/events", post(receive_event))
        .route("/status", get(lock_status))
        .route("/health", get(health_check))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn lock_status(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let locks = state
        .engine
        .status()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "locks": locks })))
}

async fn receive_event(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        if !verify_signature(secret.as_bytes(), &body, signature) {
            tracing::warn!("rejected webhook with a bad signature");
            return Err(ApiError::Unauthorized);
        }
    }

    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", EVENT_HEADER)))?;

    let event = parse_webhook(event_type, &body, &state.hostname)
        .map_err(|e| ApiError::BadRequest(format!("malformed {} payload: {}", event_type, e)))?;
    let Some(WebhookEvent { pull, kind }) = event else {
        return Ok((StatusCode::OK, "ignored").into_response());
    };

    if let (Some(bot), crate::engine::EventKind::CommentCreated { author, .. }) =
        (&state.bot_user, &kind)
        && author.eq_ignore_ascii_case(bot)
    {
        return Ok((StatusCode::OK, "ignored").into_response());
    }

    tracing::debug!(repo = %pull.repo.full_name, pr = pull.number, event = kind.name(), "queued event");
    drop(state.engine.submit(pull, kind));
    Ok((StatusCode::ACCEPTED, "queued").into_response())
}

/// Wire the production collaborators from `config`.
pub fn build_engine(config: &ServerConfig) -> Result<Engine> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;
    let locks = FileLockManager::open(&config.data_dir).context("Failed to open lock store")?;

    let github = GitHubClient::new(&config.gh_hostname, &config.gh_token)
        .with_target_url(&config.public_url);
    let vcs = RetryingVcs::new(Arc::new(github), RetryPolicy::default());
    let workdirs = GitWorkingDir::new(config.data_dir.join("repos"), Some(config.gh_token.clone()));
    let runner = RunOrchestrator::new(
        Arc::new(ProcessToolInvoker::new(config.tool_binary.clone())),
        Arc::new(workdirs),
        Duration::from_secs(config.tool_timeout_secs),
    );
    let policy = PolicyGate::new(config.allowlist()?, config.policy());

    Ok(Engine::new(
        config.engine(),
        policy,
        Arc::new(locks),
        Arc::new(vcs),
        Arc::new(FileRepoConfigLoader::new(config.repo_config_dir.clone())),
        runner,
    ))
}

pub async fn start_server(config: ServerConfig) -> Result<()> {
    let engine = Arc::new(build_engine(&config)?);
    let state = Arc::new(AppState {
        engine,
        webhook_secret: config.gh_webhook_secret.clone(),
        hostname: config.gh_hostname.clone(),
        bot_user: Some(config.gh_user.clone()),
    });
    if state.webhook_secret.is_none() {
        tracing::warn!("no webhook secret configured, payload signatures are not checked");
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(addr = %listener.local_addr()?, public_url = %config.public_url, "planlock listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::engine::EngineConfig;
    use crate::fakes::{FakeVcs, LocalWorkingDir, ScriptedTool, StaticRepoConfig};
    use crate::locking::{LockManager, MemoryLockManager};
    use crate::models::{PrRef, ProjectKey};
    use crate::policy::signature::sign;
    use crate::policy::{PolicyConfig, RepoAllowlist};
    use crate::project::RepoConfig;

    use super::github_events::fixtures;

    struct TestApp {
        _data: tempfile::TempDir,
        router: Router,
        vcs: Arc<FakeVcs>,
        locks: Arc<MemoryLockManager>,
    }

    fn test_app(secret: Option<&str>) -> TestApp {
        let data = tempfile::tempdir().unwrap();
        let vcs = Arc::new(FakeVcs::new());
        let locks = Arc::new(MemoryLockManager::new());
        let engine = Engine::new(
            EngineConfig::default(),
            PolicyGate::new(
                RepoAllowlist::parse("github.com/acme/*").unwrap(),
                PolicyConfig::default(),
            ),
            locks.clone(),
            vcs.clone(),
            Arc::new(StaticRepoConfig::new(RepoConfig::undeclared())),
            RunOrchestrator::new(
                Arc::new(ScriptedTool::new()),
                Arc::new(LocalWorkingDir::new(data.path(), &["staging"])),
                Duration::from_secs(5),
            ),
        );
        let state = Arc::new(AppState {
            engine: Arc::new(engine),
            webhook_secret: secret.map(str::to_string),
            hostname: "github.com".into(),
            bot_user: Some("planlock-bot".into()),
        });
        TestApp {
            _data: data,
            router: build_router(state),
            vcs,
            locks,
        }
    }

    fn event(event_type: &str, body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/events")
            .header(EVENT_HEADER, event_type)
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn wait_for_comments(vcs: &FakeVcs, pr: &PrRef, n: usize) -> Vec<String> {
        for _ in 0..200 {
            let comments = vcs.comments_for(pr);
            if comments.len() >= n {
                return comments;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        vcs.comments_for(pr)
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app(None);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_lists_locks() {
        let app = test_app(None);
        app.locks
            .try_acquire(
                &ProjectKey::new("acme/infra", "staging", "default"),
                &PrRef::new("acme/infra", 3),
            )
            .await
            .unwrap();
        let req = Request::builder()
            .uri("/status")
            .body(Body::empty())
            .unwrap();
        let resp = app.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["locks"][0]["owner_pr"], 3);
        assert_eq!(json["locks"][0]["dir"], "staging");
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let app = test_app(Some("secret"));
        let body = fixtures::issue_comment("planlock help", true);
        let resp = app
            .router
            .oneshot(event("issue_comment", &body, Some("sha256=00".into())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(app.vcs.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_signature_rejected_when_secret_set() {
        let app = test_app(Some("secret"));
        let body = fixtures::issue_comment("planlock help", true);
        let resp = app
            .router
            .oneshot(event("issue_comment", &body, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_signed_comment_is_processed() {
        let app = test_app(Some("secret"));
        let body = fixtures::issue_comment("planlock help", true);
        let signature = sign(b"secret", body.as_bytes());
        let resp = app
            .router
            .oneshot(event("issue_comment", &body, Some(signature)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let comments = wait_for_comments(&app.vcs, &PrRef::new("acme/infra", 7), 1).await;
        assert_eq!(comments.len(), 1);
        assert!(comments[0].contains("Commands:"));
    }

    #[tokio::test]
    async fn test_unhandled_event_type_ignored() {
        let app = test_app(None);
        let resp = app
            .router
            .oneshot(event("push", "{}", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_bad_request() {
        let app = test_app(None);
        let resp = app
            .router
            .oneshot(event("pull_request", "{", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_event_header_is_bad_request() {
        let app = test_app(None);
        let req = Request::builder()
            .method("POST")
            .uri("/events")
            .body(Body::from("{}"))
            .unwrap();
        let resp = app.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_own_comments_ignored() {
        let app = test_app(None);
        let body = serde_json::json!({
            "action": "created",
            "issue": { "number": 7, "pull_request": {} },
            "comment": { "body": "planlock help", "user": { "login": "planlock-bot" } },
            "repository": { "full_name": "acme/infra" }
        })
        .to_string();
        let resp = app
            .router
            .oneshot(event("issue_comment", &body, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(app.vcs.call_count(), 0);
    }
}
