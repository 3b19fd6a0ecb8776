//! HTTP front door: webhook ingestion, health endpoints, action history.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use lighthouse_core::agent::{ConfigAgent, PluginAgent};
use lighthouse_keeper::History;
use lighthouse_launcher::Launcher;
use lighthouse_launcher::engine::PipelineEngine;
use lighthouse_plugins::external::ExternalDispatcher;
use lighthouse_plugins::{PluginContext, Registry};
use lighthouse_scm::git::GitClient;
use lighthouse_scm::webhook::{Webhook, parse_webhook};
use lighthouse_scm::{factory, types::Repository};
use lighthouse_store::JobStore;

/// Remote user GitHub Apps authenticate git operations as.
const APP_GIT_USERNAME: &str = "x-access-token";

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process-scoped settings sourced from the environment.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub git_kind: String,
    pub git_server: String,
    pub git_token: String,
    pub bot_name: String,
    pub hmac_token: String,
    /// Directory of per-owner tokens; non-empty switches on app-install mode.
    pub app_secret_dir: String,
}

impl Options {
    pub fn from_env() -> Options {
        let env = |name: &str| std::env::var(name).unwrap_or_default();
        let mut options = Options {
            git_kind: env("GIT_KIND"),
            git_server: env("GIT_SERVER"),
            git_token: env("GIT_TOKEN"),
            bot_name: env("GIT_USER"),
            hmac_token: env("HMAC_TOKEN"),
            app_secret_dir: env("GITHUB_APP_SECRET_DIR"),
        };
        if options.git_kind.is_empty() {
            options.git_kind = "github".to_string();
        }
        if options.bot_name.is_empty() {
            options.bot_name = "lighthouse-bot".to_string();
        }
        options
    }
}

#[derive(Clone)]
pub struct AppState {
    pub options: Arc<Options>,
    pub config_agent: Arc<ConfigAgent>,
    pub plugin_agent: Arc<PluginAgent>,
    pub registry: Arc<Registry>,
    pub store: Arc<dyn JobStore>,
    pub engine: Arc<dyn PipelineEngine>,
    pub git: Arc<dyn GitClient>,
    pub external: Arc<ExternalDispatcher>,
    pub history: Arc<History>,
}

pub fn build_router(state: AppState, hook_path: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/history", get(history))
        .route(hook_path, any(hook))
        .with_state(state)
}

async fn health() -> StatusCode { StatusCode::NO_CONTENT }

async fn ready(State(state): State<AppState>) -> StatusCode {
    if state.config_agent.loaded() && state.plugin_agent.loaded() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn history(State(state): State<AppState>) -> Response {
    Json(state.history.all_records()).into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    tracing::info!(status = %status, "{message}");
    (status, message).into_response()
}

async fn hook(State(state): State<AppState>, request: Request) -> Response {
    if request.method() != Method::POST {
        // Liveness probes hit the hook path with GET.
        tracing::debug!(method = %request.method(), "Ignoring non-POST hook request");
        return StatusCode::OK.into_response();
    }
    let kind = request
        .headers()
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let signature = request
        .headers()
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = match axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024).await {
        Ok(body) => body,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("500 Internal Server Error: Read Body: {e}"),
            );
        }
    };

    let secret = (!state.options.hmac_token.is_empty()).then_some(state.options.hmac_token.as_str());
    let hook = match parse_webhook(&kind, signature.as_deref(), &body, secret) {
        Ok(Some(hook)) => hook,
        Ok(None) => {
            tracing::debug!(kind = %kind, "Unknown webhook kind");
            return (StatusCode::OK, format!("unknown hook {kind}")).into_response();
        }
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("500 Internal Server Error: Failed to parse webhook: {e}"),
            );
        }
    };

    if let Webhook::Ping(_) = hook {
        tracing::info!("Received ping");
        return (StatusCode::OK, format!("pong from lighthouse {VERSION}")).into_response();
    }
    let Some(repository) = hook.repository().cloned() else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "500 Internal Server Error: no repository in webhook".to_string(),
        );
    };

    let Some(config) = state.config_agent.snapshot() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "configuration not loaded yet".to_string(),
        );
    };
    let Some(plugin_config) = state.plugin_agent.snapshot() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "plugin configuration not loaded yet".to_string(),
        );
    };

    let full_name = repository.full_name();
    // In app-install mode only repositories we have jobs for are served.
    if !state.options.app_secret_dir.is_empty() && !config.has_jobs_for(&full_name) {
        tracing::info!(repo = %full_name, "Webhook from unconfigured repository");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("repository not configured: {}", repository.link),
        );
    }

    let (clone_user, token) = match resolve_credentials(&state.options, &repository) {
        Ok(credentials) => credentials,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("500 Internal Server Error: {e:#}"),
            );
        }
    };
    let scm = match factory::create(
        &state.options.git_kind,
        &state.options.git_server,
        &token,
        &state.options.bot_name,
    ) {
        Ok(scm) => scm,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("500 Internal Server Error: Failed to create SCM client: {e:#}"),
            );
        }
    };
    state.git.set_credentials(&clone_user, &token);

    let ctx = PluginContext {
        scm,
        git: state.git.clone(),
        store: state.store.clone(),
        launcher: Arc::new(Launcher::new(state.store.clone(), state.engine.clone())),
        bot_name: state.options.bot_name.clone(),
        config,
        plugin_config: plugin_config.clone(),
    };
    tracing::info!(repo = %full_name, kind = %hook.kind(), "Dispatching webhook");
    state.registry.dispatch(&ctx, &hook).await;

    // Re-deliver the original payload to subscribed external plugins.
    let external = state.registry.external_plugins_for(&plugin_config, &full_name, hook.kind());
    if !external.is_empty() {
        state.external.dispatch(external, &kind, Arc::new(body.to_vec()));
    }

    (StatusCode::OK, response_body(&hook)).into_response()
}

fn response_body(hook: &Webhook) -> &'static str {
    match hook {
        Webhook::Push(_) => "processed push hook",
        Webhook::PullRequest(_) => "processed PR hook",
        Webhook::Branch(_) => "processed branch hook",
        Webhook::IssueComment(_) => "processed issue comment hook",
        Webhook::PullRequestComment(_) => "processed PR comment hook",
        Webhook::Review(_) => "processed PR review hook",
        Webhook::Ping(_) => "pong",
    }
}

/// Credentials for this delivery: a per-owner token in app-install mode, the
/// process-scoped bot token otherwise.
fn resolve_credentials(options: &Options, repository: &Repository) -> Result<(String, String)> {
    if !options.app_secret_dir.is_empty() {
        let token = find_owner_token(&options.app_secret_dir, &repository.namespace)
            .with_context(|| format!("failed to read owner token for {}", repository.namespace))?;
        return Ok((APP_GIT_USERNAME.to_string(), token));
    }
    if options.git_token.is_empty() {
        anyhow::bail!("no SCM token specified for git kind {}: set $GIT_TOKEN", options.git_kind);
    }
    Ok((options.bot_name.clone(), options.git_token.clone()))
}

fn find_owner_token(dir: &str, owner: &str) -> Result<String> {
    let base = Path::new(dir).join(owner);
    let candidates = [base.join("token"), base];
    for path in &candidates {
        if path.is_file() {
            let token = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            return Ok(token.trim().to_string());
        }
    }
    anyhow::bail!("no token found under {dir} for owner {owner}")
}

#[cfg(test)]
mod tests {
    use lighthouse_core::{Config, PluginConfig};
    use lighthouse_launcher::engine::RecordingEngine;
    use lighthouse_scm::fake::FakeGit;
    use lighthouse_store::InMemoryJobStore;
    use tower::ServiceExt;

    use super::*;

    fn state(options: Options, config: Config) -> AppState {
        let config_agent = Arc::new(ConfigAgent::new());
        config_agent.set(config);
        let plugin_agent = Arc::new(PluginAgent::new());
        plugin_agent.set(PluginConfig::default());
        AppState {
            options: Arc::new(options),
            config_agent,
            plugin_agent,
            registry: Arc::new(Registry::with_defaults()),
            store: Arc::new(InMemoryJobStore::new()),
            engine: Arc::new(RecordingEngine::default()),
            git: Arc::new(FakeGit::default()),
            external: Arc::new(ExternalDispatcher::new("")),
            history: Arc::new(History::new(10)),
        }
    }

    fn post_hook(body: &str, kind: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/hook")
            .header("X-GitHub-Event", kind)
            .body(axum::body::Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response) -> (StatusCode, String) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    const PR_BODY: &str = r#"{
        "action": "opened",
        "pull_request": {
            "number": 7,
            "user": {"login": "dev"},
            "head": {"ref": "feature", "sha": "abc"},
            "base": {"ref": "master", "sha": "def"},
            "state": "open"
        },
        "repository": {
            "name": "unknown",
            "owner": {"login": "org"},
            "html_url": "https://github.com/org/unknown"
        },
        "sender": {"login": "dev"}
    }"#;

    #[tokio::test]
    async fn test_health_and_ready() {
        let router = build_router(state(Options::default(), Config::default()), "/hook");
        let response =
            router.clone().oneshot(Request::get("/health").body(axum::body::Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response =
            router.oneshot(Request::get("/ready").body(axum::body::Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_ready_requires_loaded_config() {
        let app_state = state(Options::default(), Config::default());
        let unready = AppState { config_agent: Arc::new(ConfigAgent::new()), ..app_state };
        let router = build_router(unready, "/hook");
        let response =
            router.oneshot(Request::get("/ready").body(axum::body::Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_non_post_hook_is_tolerated() {
        let router = build_router(state(Options::default(), Config::default()), "/hook");
        let response =
            router.oneshot(Request::get("/hook").body(axum::body::Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ping_pongs() {
        let router = build_router(state(Options::default(), Config::default()), "/hook");
        let response = router.oneshot(post_hook("{\"zen\": \"ok\"}", "ping")).await.unwrap();
        let (status, body) = body_string(response).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("pong from lighthouse"));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_ok() {
        let router = build_router(state(Options::default(), Config::default()), "/hook");
        let response = router.oneshot(post_hook("{}", "workflow_dispatch")).await.unwrap();
        let (status, body) = body_string(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "unknown hook workflow_dispatch");
    }

    #[tokio::test]
    async fn test_app_mode_rejects_unconfigured_repo() {
        let options = Options {
            app_secret_dir: "/nonexistent".to_string(),
            git_kind: "github".to_string(),
            bot_name: "lighthouse-bot".to_string(),
            ..Options::default()
        };
        let router = build_router(state(options, Config::default()), "/hook");
        let response = router.oneshot(post_hook(PR_BODY, "pull_request")).await.unwrap();
        let (status, body) = body_string(response).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("repository not configured"), "body: {body}");
    }

    #[tokio::test]
    async fn test_bad_signature_is_server_error() {
        let options = Options { hmac_token: "secret".to_string(), ..Options::default() };
        let router = build_router(state(options, Config::default()), "/hook");
        let mut request = post_hook(PR_BODY, "pull_request");
        request.headers_mut().insert("X-Hub-Signature-256", "sha256=00ff".parse().unwrap());
        let response = router.oneshot(request).await.unwrap();
        let (status, body) = body_string(response).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("Failed to parse webhook"), "body: {body}");
    }

    #[tokio::test]
    async fn test_missing_token_is_server_error() {
        // Bot-token mode with no token configured.
        let options = Options { git_kind: "github".to_string(), ..Options::default() };
        let router = build_router(state(options, Config::default()), "/hook");
        let response = router.oneshot(post_hook(PR_BODY, "pull_request")).await.unwrap();
        let (status, body) = body_string(response).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("no SCM token"), "body: {body}");
    }

    #[tokio::test]
    async fn test_pr_hook_processed() {
        let options = Options {
            git_kind: "github".to_string(),
            git_token: "token".to_string(),
            bot_name: "lighthouse-bot".to_string(),
            ..Options::default()
        };
        let router = build_router(state(options, Config::default()), "/hook");
        let response = router.oneshot(post_hook(PR_BODY, "pull_request")).await.unwrap();
        let (status, body) = body_string(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "processed PR hook");
    }

    #[tokio::test]
    async fn test_owner_token_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let owner_dir = dir.path().join("org");
        std::fs::create_dir_all(&owner_dir).unwrap();
        std::fs::write(owner_dir.join("token"), "s3cret\n").unwrap();
        let token = find_owner_token(dir.path().to_str().unwrap(), "org").unwrap();
        assert_eq!(token, "s3cret");
        assert!(find_owner_token(dir.path().to_str().unwrap(), "other").is_err());
    }
}
