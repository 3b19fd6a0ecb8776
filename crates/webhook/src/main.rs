mod cron;
mod hooks;
mod watcher;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::http::{Request, header};
use lighthouse_core::agent::{ConfigAgent, PluginAgent};
use lighthouse_foghorn::{Controller, DEFAULT_WORKERS};
use lighthouse_keeper::{History, Keeper, NoopBlobStore};
use lighthouse_launcher::Launcher;
use lighthouse_launcher::engine::{HttpEngine, PipelineEngine};
use lighthouse_plugins::Registry;
use lighthouse_plugins::external::ExternalDispatcher;
use lighthouse_scm::factory;
use lighthouse_scm::git::{CommandGit, GitClient};
use lighthouse_store::{InMemoryJobStore, JobStore};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{ServiceBuilderExt, timeout::TimeoutLayer, trace::{DefaultOnResponse, MakeSpan, TraceLayer}};
use tracing::{Level, Span};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

use crate::hooks::{AppState, Options, build_router};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                // Default to info level
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let options = Arc::new(Options::from_env());
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let plugins_path =
        std::env::var("PLUGINS_PATH").unwrap_or_else(|_| "plugins.yaml".to_string());

    let config_agent = Arc::new(ConfigAgent::new());
    let plugin_agent = Arc::new(PluginAgent::new());
    watcher::initial_load(&config_path, &plugins_path, &config_agent, &plugin_agent);
    let boot_config = config_agent.snapshot();
    if boot_config.is_none() {
        tracing::warn!(path = %config_path, "No configuration loaded yet, serving unready");
    }
    let server = boot_config.as_ref().map(|c| c.server.clone()).unwrap_or_default();
    let engine_url = boot_config.as_ref().map(|c| c.engine.url.clone()).unwrap_or_default();
    if engine_url.is_empty() {
        tracing::warn!("engine.url is not configured, pipeline launches will fail");
    }
    let keeper_config = boot_config.map(|c| c.keeper.clone()).unwrap_or_default();

    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let engine: Arc<dyn PipelineEngine> =
        Arc::new(HttpEngine::new(&engine_url).expect("Failed to create engine client"));
    let git: Arc<dyn GitClient> = Arc::new(CommandGit::new());
    if !options.git_token.is_empty() {
        git.set_credentials(&options.bot_name, &options.git_token);
    }
    let scm = factory::create(
        &options.git_kind,
        &options.git_server,
        &options.git_token,
        &options.bot_name,
    )
    .expect("Failed to create SCM client");
    let external = Arc::new(ExternalDispatcher::new(&options.hmac_token));
    let history = Arc::new(History::with_blob_store(
        keeper_config.history_limit,
        &keeper_config.history_path,
        Arc::new(NoopBlobStore),
    ));
    let launcher = Arc::new(Launcher::new(store.clone(), engine.clone()));

    let cancel = CancellationToken::new();
    tokio::spawn(watcher::watch(
        config_path,
        plugins_path,
        config_agent.clone(),
        plugin_agent.clone(),
        cancel.clone(),
    ));

    let controller = Arc::new(Controller::new(
        store.clone(),
        scm.clone(),
        config_agent.clone(),
        plugin_agent.clone(),
        external.clone(),
    ));
    let controller_handle = tokio::spawn(controller.run(DEFAULT_WORKERS, cancel.clone()));

    let keeper = Arc::new(Keeper::new(
        scm,
        git.clone(),
        store.clone(),
        launcher,
        config_agent.clone(),
        history.clone(),
    ));
    let keeper_handle = tokio::spawn(keeper.run(cancel.clone()));

    let mut scheduler = cron::create(history.clone()).await.expect("Failed to create scheduler");

    let state = AppState {
        options,
        config_agent,
        plugin_agent,
        registry: Arc::new(Registry::with_defaults()),
        store,
        engine,
        git,
        external: external.clone(),
        history,
    };
    let sensitive_headers: Arc<[_]> = vec![header::AUTHORIZATION].into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .sensitive_response_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(HookMakeSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::new(Duration::from_secs(60)));
    let app = build_router(state, &server.hook_path).layer(middleware);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, server.port));
    tracing::info!(
        "Lighthouse is now listening on path {} and port {} for webhooks",
        server.hook_path,
        server.port
    );
    axum::serve(
        TcpListener::bind(addr).await.expect("bind error"),
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await
    .expect("server error");

    cancel.cancel();
    let _ = keeper_handle.await;
    let _ = controller_handle.await;
    external.shutdown().await;
    scheduler.shutdown().await.expect("Failed to shut down scheduler");
    tracing::info!("Shut down gracefully");
}

async fn shutdown_signal(cancel: CancellationToken) {
    wait_for_signal().await;
    tracing::warn!("Interrupt received, attempting clean shutdown...");
    cancel.cancel();
    tokio::spawn(async {
        wait_for_signal().await;
        tracing::error!("Second interrupt received, force exiting...");
        std::process::exit(1);
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[derive(Debug, Clone)]
pub struct HookMakeSpan {
    level: Level,
}

impl<B> MakeSpan<B> for HookMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(socket_addr)| socket_addr.ip())
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("[unknown]");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    ip = %ip,
                    user_agent = %user_agent,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
