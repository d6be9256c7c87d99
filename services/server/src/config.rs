//! Startup configuration (spec.md §6 "Configuration (environment)").
//!
//! Mirrors the teacher's habit of reading every environment variable in one
//! place in `main.rs` (`DATABASE_URL`/`BIND_ADDR`), generalized to the full
//! set of variables this service needs, with validation and clamping done
//! once at startup rather than scattered across call sites.

use std::env;
use tracing::warn;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_PATH: &str = "./data/errly.db";
const DEFAULT_MAX_SUBSCRIPTIONS: usize = 50;
const DEFAULT_MAX_SSE_CLIENTS: usize = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub password: String,
    pub railway_api_token: Option<String>,
    pub railway_project_id: Option<String>,
    pub railway_environment_name: Option<String>,
    pub railway_service_id: Option<String>,
    pub port: u16,
    pub db_path: String,
    pub max_subscriptions: usize,
    pub max_sse_clients: usize,
    pub node_env: String,
}

impl Config {
    /// Reads and validates every variable named in spec.md §6. Panics only
    /// on the one variable the service cannot run without (`ERRLY_PASSWORD`),
    /// exactly as the teacher panics on a missing `DATABASE_URL`.
    pub fn from_env() -> Self {
        let password = env::var("ERRLY_PASSWORD").expect("ERRLY_PASSWORD must be set");
        if password.len() < 8 {
            warn!("ERRLY_PASSWORD is shorter than 8 characters; this is weak for a dashboard credential");
        }

        let railway_api_token = env::var("RAILWAY_API_TOKEN").ok().filter(|s| !s.is_empty());
        let auto_capture_enabled = railway_api_token.is_some();
        if !auto_capture_enabled {
            warn!("RAILWAY_API_TOKEN not set; auto-capture discovery is disabled, only direct ingestion is available");
        }

        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let db_path = env::var("ERRLY_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_owned());

        let max_subscriptions = env::var("ERRLY_MAX_SUBSCRIPTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_SUBSCRIPTIONS);

        let max_sse_clients = env::var("ERRLY_MAX_SSE_CLIENTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_SSE_CLIENTS);

        Self {
            password,
            railway_api_token,
            railway_project_id: env::var("RAILWAY_PROJECT_ID").ok(),
            railway_environment_name: env::var("RAILWAY_ENVIRONMENT_NAME").ok(),
            railway_service_id: env::var("RAILWAY_SERVICE_ID").ok(),
            port,
            db_path,
            max_subscriptions,
            max_sse_clients,
            node_env: env::var("NODE_ENV").unwrap_or_else(|_| "production".to_owned()),
        }
    }

    pub fn auto_capture_enabled(&self) -> bool {
        self.railway_api_token.is_some()
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

/// Clamp `retentionDays` to spec.md §4.9's [1, 90] range.
pub fn clamp_retention_days(days: i64) -> i64 {
    days.clamp(1, 90)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_retention_days_clamps_both_ends() {
        assert_eq!(clamp_retention_days(0), 1);
        assert_eq!(clamp_retention_days(365), 90);
        assert_eq!(clamp_retention_days(7), 7);
    }
}
