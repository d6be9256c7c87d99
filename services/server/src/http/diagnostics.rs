//! `GET /api/diagnostics` (spec.md §6) — session-authenticated operator view
//! of the platform client's circuit/rate-limit state and the watcher's
//! subscription set.

use axum::{extract::State, http::header, http::HeaderMap, Json};
use serde::Serialize;

use crate::errors::HttpError;
use crate::http::response::HttpResult;
use crate::state::{AppState, SubscriptionStatus};

const SESSION_COOKIE_NAME: &str = "errly_session";
const ERROR_RATE_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlatformDiagnostics {
    circuit_open: bool,
    auth_expired: bool,
    rate_limit_remaining: Option<i64>,
    rate_limit_resets_at_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionDiagnostics {
    deployment_id: String,
    service_name: String,
    state: &'static str,
    last_message_at_ms: i64,
}

impl From<SubscriptionStatus> for SubscriptionDiagnostics {
    fn from(status: SubscriptionStatus) -> Self {
        Self {
            deployment_id: status.deployment_id,
            service_name: status.service_name,
            state: status.state,
            last_message_at_ms: status.last_message_at_ms,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DiagnosticsBody {
    auto_capture_enabled: bool,
    active_subscriptions: usize,
    last_discovery_at_ms: Option<i64>,
    sse_clients: usize,
    subscriptions: Vec<SubscriptionDiagnostics>,
    errors_per_minute: i64,
    platform: Option<PlatformDiagnostics>,
    memory_rss_bytes: Option<u64>,
}

/// Best-effort resident-set-size read from `/proc/self/status`; `None` on
/// any platform where that file does not exist or cannot be parsed.
fn read_rss_bytes() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = contents.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

pub async fn diagnostics(State(state): State<AppState>, headers: HeaderMap) -> HttpResult<Json<DiagnosticsBody>> {
    let cookie_header = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| HttpError::Unauthorized("missing session cookie".to_owned()))?;
    let raw_token = crate::auth::extract_session_cookie(cookie_header, SESSION_COOKIE_NAME)
        .ok_or_else(|| HttpError::Unauthorized("missing session cookie".to_owned()))?;
    let now_ms = chrono::Utc::now().timestamp_millis();
    if !crate::auth::validate_session(&state.pool, &raw_token, now_ms).await {
        return Err(HttpError::Unauthorized("session expired".to_owned()));
    }

    let diagnostics = state.diagnostics.read().await;
    let platform = match &state.platform {
        Some(client) => {
            let rate_limit = client.rate_limit_info().await;
            Some(PlatformDiagnostics {
                circuit_open: client.is_breaker_open(now_ms).await,
                auth_expired: client.has_auth_error().await,
                rate_limit_remaining: rate_limit.map(|r| r.remaining),
                rate_limit_resets_at_ms: rate_limit.map(|r| r.resets_at_ms),
            })
        }
        None => None,
    };
    let errors_per_minute = crate::store::error_groups::count_recent(&state.pool, now_ms - ERROR_RATE_WINDOW_MS).await?;

    Ok(Json(DiagnosticsBody {
        auto_capture_enabled: state.config.auto_capture_enabled(),
        active_subscriptions: diagnostics.active_subscriptions,
        last_discovery_at_ms: diagnostics.last_discovery_at_ms,
        sse_clients: state.hub.client_count().await,
        subscriptions: diagnostics.subscriptions.iter().cloned().map(Into::into).collect(),
        errors_per_minute,
        platform,
        memory_rss_bytes: read_rss_bytes(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::HeaderValue;

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
    async fn rejects_missing_session_cookie() {
        let state = test_state().await;
        let result = diagnostics(State(state), HeaderMap::new()).await;
        assert!(matches!(result, Err(HttpError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn rejects_unknown_session_token() {
        let state = test_state().await;
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("errly_session=bogus"));
        let result = diagnostics(State(state), headers).await;
        assert!(matches!(result, Err(HttpError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn returns_snapshot_for_valid_session_without_platform_client() {
        let state = test_state().await;
        crate::store::sessions::create(&state.pool, "good-token", i64::MAX)
            .await
            .unwrap();
        state.record_discovery(2, 500).await;

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("errly_session=good-token"));
        let Json(body) = diagnostics(State(state), headers).await.unwrap();
        assert_eq!(body.active_subscriptions, 2);
        assert_eq!(body.last_discovery_at_ms, Some(500));
        assert!(body.subscriptions.is_empty());
        assert_eq!(body.errors_per_minute, 0);
        assert!(body.platform.is_none());
    }
}
