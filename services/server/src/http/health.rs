//! `GET /health` (spec.md §6) — unauthenticated liveness/readiness probe.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    uptime: i64,
    db_connected: bool,
    auto_capture_enabled: bool,
    active_subscriptions: usize,
    sse_clients: usize,
    last_discovery_at: Option<i64>,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_connected = crate::db::ping(&state.pool).await;
    let diagnostics = state.diagnostics.read().await;
    let body = HealthBody {
        status: if db_connected { "ok" } else { "degraded" },
        uptime: chrono::Utc::now().timestamp_millis() - state.started_at_ms,
        db_connected,
        auto_capture_enabled: state.config.auto_capture_enabled(),
        active_subscriptions: diagnostics.active_subscriptions,
        sse_clients: state.hub.client_count().await,
        last_discovery_at: diagnostics.last_discovery_at_ms,
    };
    let status = if db_connected { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::to_bytes;

    async fn test_state() -> AppState {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let config = Config {
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
        };
        AppState::new(pool, config)
    }

    #[tokio::test]
    async fn reports_ok_when_db_reachable() {
        let state = test_state().await;
        let response = health(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["dbConnected"], true);
        assert_eq!(parsed["autoCaptureEnabled"], false);
    }

    #[tokio::test]
    async fn reflects_diagnostics_snapshot() {
        let state = test_state().await;
        state.record_discovery(4, 1_234).await;
        let response = health(State(state)).await.into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["activeSubscriptions"], 4);
        assert_eq!(parsed["lastDiscoveryAt"], 1_234);
    }
}
