use agent_bridge::api::{
    cron::{self as cron_api, CronState},
    fs as fs_api,
    sessions::{self as sessions_api, SessionsState},
};
use agent_bridge::core::config::Settings;
use agent_bridge::core::naming::HeuristicNamer;
use agent_bridge::core::recovery;
use agent_bridge::core::storage::{FileSessionStore, SessionStore};
use agent_bridge::core::webhook::WebhookNotifier;
use agent_bridge::cron::{CheckerRegistry, CronScheduler, CronStore};
use agent_bridge::ws::bridge::WsBridge;
use agent_bridge::ws::cli_handler::ws_sub_handler;
use agent_bridge::ws::client_handler::ws_browser_handler;
use agent_bridge::ws::launcher::{CliLauncher, LauncherConfig};
use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_bridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::new()?;
    info!(
        "Starting bridge server on port {} (sessions: {})",
        settings.port,
        settings.sessions_dir.display()
    );

    let store: Arc<dyn SessionStore> = FileSessionStore::new(&settings.sessions_dir);

    let (launcher, mut exit_rx) = CliLauncher::new(
        LauncherConfig {
            binary: settings.bridge_binary.clone(),
            port: settings.port,
            tls: settings.tls_enabled(),
            self_signed: settings.self_signed(),
            default_cwd: settings.default_cwd.clone(),
        },
        store.clone(),
    );
    let launcher = Arc::new(launcher);

    let mut bridge =
        WsBridge::new(store.clone(), launcher.clone()).with_namer(Arc::new(HeuristicNamer));
    if let Some(url) = settings.webhook_url.clone().filter(|u| !u.is_empty()) {
        bridge = bridge.with_webhook(Arc::new(WebhookNotifier::new(url)?));
    }
    let bridge = Arc::new(bridge);

    // Child exits archive the bridge record so the session refuses input.
    {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            while let Some(event) = exit_rx.recv().await {
                bridge.mark_archived(&event.session_id).await;
            }
        });
    }

    recovery::recover_sessions(&store, &launcher, &bridge).await;
    let _pid_monitor = recovery::spawn_pid_monitor(launcher.clone(), bridge.clone());
    let _cleanup = recovery::spawn_cleanup(
        launcher.clone(),
        bridge.clone(),
        settings.session_ttl_days,
    );

    let cron_store = Arc::new(CronStore::new(settings.cron_dir()).await);
    let registry = Arc::new(CheckerRegistry::with_builtins()?);
    let scheduler = Arc::new(CronScheduler::new(
        cron_store.clone(),
        registry,
        launcher.clone(),
        bridge.clone(),
    ));
    scheduler.clone().start().await;

    let app = create_app(
        bridge.clone(),
        launcher.clone(),
        store.clone(),
        cron_store.clone(),
        scheduler.clone(),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server running on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain everything before exit; no in-flight persistence may be lost.
    info!("Shutting down: stopping scheduler, flushing stores");
    scheduler.stop().await;
    store.flush().await;
    cron_store.flush().await;
    info!("Shutdown complete");
    Ok(())
}

fn create_app(
    bridge: Arc<WsBridge>,
    launcher: Arc<CliLauncher>,
    store: Arc<dyn SessionStore>,
    cron_store: Arc<CronStore>,
    scheduler: Arc<CronScheduler>,
) -> Router {
    let ws_routes = Router::new()
        .route("/ws/sub/:session_id", get(ws_sub_handler))
        .route("/ws/browser/:session_id", get(ws_browser_handler))
        .with_state(bridge.clone());

    let sessions_state = SessionsState {
        bridge,
        launcher,
        store,
    };
    let cron_state = CronState {
        store: cron_store,
        scheduler,
    };

    Router::new()
        .route("/health", get(health_check))
        .merge(ws_routes)
        .merge(sessions_api::router(sessions_state))
        .merge(cron_api::router(cron_state))
        .merge(fs_api::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
