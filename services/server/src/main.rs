use std::env;
use std::time::Duration;

use server::config::Config;
use server::state::AppState;
use server::watcher::{Watcher, WatcherConfig};
use server::{db, pushhub, retention};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Overall budget for graceful shutdown before the process force-exits
/// (spec.md §5 "Cancellation & timeouts").
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(8);

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = Config::from_env();

    info!(path = %config.db_path, "opening store...");
    let pool = db::create_pool(&config.db_path).await;
    db::run_migrations(&pool).await;
    info!("migrations applied");

    let bind_addr = config.bind_addr();
    let state = AppState::new(pool.clone(), config.clone());

    let watcher_handles = match (state.platform.clone(), config.railway_project_id.clone()) {
        (Some(platform), Some(project_id)) => {
            let watcher_config = WatcherConfig {
                project_id,
                environment_name: config.railway_environment_name.clone(),
                self_service_id: config.railway_service_id.clone(),
                max_subscriptions: config.max_subscriptions,
            };
            let watcher = Watcher::new_with_diagnostics(
                watcher_config,
                platform,
                pool.clone(),
                state.hub.clone(),
                state.http.clone(),
                state.diagnostics.clone(),
            );
            Some(server::watcher::spawn(watcher))
        }
        (Some(_), None) => {
            warn!("RAILWAY_API_TOKEN set but RAILWAY_PROJECT_ID missing; auto-capture disabled");
            None
        }
        _ => None,
    };

    let retention_handle = retention::spawn(pool.clone(), state.hub.clone());
    let revalidation_handle = pushhub::spawn_revalidation_task(state.hub.clone(), pool.clone());

    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    info!("draining dashboard subscribers...");
    state.hub.shutdown().await;

    retention_handle.abort();
    revalidation_handle.abort();
    if let Some((discovery_handle, health_handle)) = watcher_handles {
        discovery_handle.abort();
        health_handle.abort();
    }

    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT), then enforces `SHUTDOWN_BUDGET`
/// against whatever graceful drain axum performs afterward.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }

    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_BUDGET).await;
        warn!("graceful shutdown exceeded budget, forcing exit");
        std::process::exit(1);
    });
}
