use std::sync::Arc;

use reqwest::Client;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::http::rate_limit::RateLimiter;
use crate::platform_client::PlatformClient;
use crate::pushhub::PushHub;

/// One live or recently-closed subscription, as exposed by
/// `/api/diagnostics`'s per-subscription status list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub deployment_id: String,
    pub service_name: String,
    pub state: &'static str,
    pub last_message_at_ms: i64,
}

/// Diagnostics snapshot published by the watcher, read by `/api/diagnostics`
/// without needing a direct handle into the watcher's internal state.
#[derive(Clone, Debug, Default)]
pub struct WatcherDiagnostics {
    pub active_subscriptions: usize,
    pub last_discovery_at_ms: Option<i64>,
    pub subscriptions: Vec<SubscriptionStatus>,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub http: Client,
    pub hub: Arc<PushHub>,
    pub platform: Option<Arc<PlatformClient>>,
    pub diagnostics: Arc<RwLock<WatcherDiagnostics>>,
    pub ingest_rate_limiter: Arc<RateLimiter>,
    pub started_at_ms: i64,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        let config = Arc::new(config);
        let http = Client::builder()
            .build()
            .expect("failed to build shared http client");
        let platform = if config.auto_capture_enabled() {
            Some(Arc::new(PlatformClient::new(
                "https://backboard.railway.com".to_owned(),
                config.railway_api_token.clone().unwrap_or_default(),
            )))
        } else {
            None
        };
        Self {
            pool,
            hub: PushHub::new(config.max_sse_clients),
            config,
            http,
            platform,
            diagnostics: Arc::new(RwLock::new(WatcherDiagnostics::default())),
            ingest_rate_limiter: Arc::new(RateLimiter::new()),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub async fn record_discovery(&self, active_subscriptions: usize, now_ms: i64) {
        let mut diagnostics = self.diagnostics.write().await;
        diagnostics.active_subscriptions = active_subscriptions;
        diagnostics.last_discovery_at_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn in_memory_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn test_config() -> Config {
        Config {
            password: "at-least-8-chars".to_owned(),
            railway_api_token: None,
            railway_project_id: None,
            railway_environment_name: None,
            railway_service_id: None,
            port: 3000,
            db_path: "./data/errly.db".to_owned(),
            max_subscriptions: 50,
            max_sse_clients: 100,
            node_env: "test".to_owned(),
        }
    }

    #[tokio::test]
    async fn platform_client_absent_without_railway_token() {
        let pool = in_memory_pool().await;
        let state = AppState::new(pool, test_config());
        assert!(state.platform.is_none());
    }

    #[tokio::test]
    async fn record_discovery_updates_diagnostics_snapshot() {
        let pool = in_memory_pool().await;
        let state = AppState::new(pool, test_config());
        state.record_discovery(3, 1_000).await;
        let diagnostics = state.diagnostics.read().await;
        assert_eq!(diagnostics.active_subscriptions, 3);
        assert_eq!(diagnostics.last_discovery_at_ms, Some(1_000));
    }
}
