//! Transport to the host platform's API: unary discovery requests plus
//! long-lived log-stream subscriptions, guarded by a circuit breaker, an
//! auth-error latch, and rate-limit accounting (spec.md §4.4).
//!
//! The streaming side is modeled the way `ws_forwarder::handle_forwarder_socket`
//! owns one socket's receive loop and redials nothing itself — here a
//! background task redials the platform's stream endpoint with exponential
//! backoff and forwards batches over an mpsc channel that the caller drains
//! cooperatively.

use std::sync::Arc;
use std::time::Duration;

use errly_protocol::{Deployment, LogLine, RateLimitInfo};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const FAILURE_THRESHOLD: u32 = 5;
const OPEN_DURATION: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("platform rejected credentials")]
    Auth,
    #[error("rate limited until {resets_at_ms}")]
    RateLimited { resets_at_ms: i64 },
    #[error("circuit breaker is open")]
    BreakerOpen,
}

/// Tracks consecutive-failure-driven open/half-open/closed transitions.
/// Owned by exactly one `PlatformClient`; never shared behind a global.
struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at_ms: i64,
}

impl Breaker {
    fn new() -> Self {
        Self { state: BreakerState::Closed, consecutive_failures: 0, opened_at_ms: 0 }
    }

    fn allows_request(&mut self, now_ms: i64) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if now_ms - self.opened_at_ms >= OPEN_DURATION.as_millis() as i64 {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => true,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    fn record_failure(&mut self, now_ms: i64) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at_ms = now_ms;
            }
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= FAILURE_THRESHOLD {
                    self.state = BreakerState::Open;
                    self.opened_at_ms = now_ms;
                }
            }
            BreakerState::Open => {}
        }
    }
}

#[derive(Default)]
struct RateLimitTracker {
    info: Option<RateLimitInfo>,
}

impl RateLimitTracker {
    fn update(&mut self, info: RateLimitInfo) {
        self.info = Some(info);
    }

    fn is_rate_limited(&self, now_ms: i64) -> bool {
        match self.info {
            Some(info) => info.remaining <= 0 && now_ms < info.resets_at_ms,
            None => false,
        }
    }
}

struct AuthLatch {
    latched: bool,
}

impl AuthLatch {
    fn new() -> Self {
        Self { latched: false }
    }
}

fn is_auth_error_body(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("unauthorized") || lower.contains("forbidden") || lower.contains("authentication")
}

/// State shared between the unary request path and the streaming task.
struct Shared {
    breaker: Mutex<Breaker>,
    rate_limit: Mutex<RateLimitTracker>,
    auth_latch: Mutex<AuthLatch>,
}

pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    shared: Arc<Shared>,
}

impl PlatformClient {
    pub fn new(base_url: String, token: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build platform http client");
        Self {
            http,
            base_url,
            token,
            shared: Arc::new(Shared {
                breaker: Mutex::new(Breaker::new()),
                rate_limit: Mutex::new(RateLimitTracker::default()),
                auth_latch: Mutex::new(AuthLatch::new()),
            }),
        }
    }

    pub async fn has_auth_error(&self) -> bool {
        self.shared.auth_latch.lock().await.latched
    }

    pub async fn is_breaker_open(&self, now_ms: i64) -> bool {
        !self.shared.breaker.lock().await.allows_request(now_ms)
    }

    pub async fn rate_limit_info(&self) -> Option<RateLimitInfo> {
        self.shared.rate_limit.lock().await.info
    }

    /// Admission check + dispatch shared by every unary call. `perform`
    /// actually issues the request and returns the raw response.
    async fn guarded_request(
        &self,
        now_ms: i64,
        perform: impl std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    ) -> Result<reqwest::Response, PlatformError> {
        if self.shared.auth_latch.lock().await.latched {
            return Err(PlatformError::Auth);
        }
        if self.shared.rate_limit.lock().await.is_rate_limited(now_ms) {
            return Err(PlatformError::RateLimited { resets_at_ms: 0 });
        }
        if !self.shared.breaker.lock().await.allows_request(now_ms) {
            return Err(PlatformError::BreakerOpen);
        }

        match perform.await {
            Ok(response) => {
                record_rate_limit_headers(&self.shared, response.headers()).await;
                let status = response.status();
                if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                    self.shared.auth_latch.lock().await.latched = true;
                    return Err(PlatformError::Auth);
                }
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    self.shared.breaker.lock().await.record_failure(now_ms);
                    return Err(PlatformError::RateLimited { resets_at_ms: 0 });
                }
                if status.is_server_error() {
                    self.shared.breaker.lock().await.record_failure(now_ms);
                    return Err(PlatformError::Transport(format!("server error: {status}")));
                }
                if status.is_client_error() {
                    self.shared.breaker.lock().await.record_failure(now_ms);
                    return Err(PlatformError::Transport(format!("client error: {status}")));
                }
                self.shared.breaker.lock().await.record_success();
                Ok(response)
            }
            Err(e) => {
                self.shared.breaker.lock().await.record_failure(now_ms);
                Err(PlatformError::Transport(e.to_string()))
            }
        }
    }

    /// GraphQL-style discovery query; in-band error bodies containing
    /// auth keywords also latch, per spec.md §4.4.
    pub async fn list_deployments(
        &self,
        project_id: &str,
        now_ms: i64,
    ) -> Result<Vec<Deployment>, PlatformError> {
        let url = format!("{}/graphql/v2", self.base_url);
        let body = serde_json::json!({
            "query": "query($projectId: String!) { deployments(projectId: $projectId) { id status serviceName environmentName } }",
            "variables": { "projectId": project_id },
        });
        let request = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send();
        let response = self.guarded_request(now_ms, request).await?;
        let text = response
            .text()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        if is_auth_error_body(&text) {
            self.shared.auth_latch.lock().await.latched = true;
            return Err(PlatformError::Auth);
        }
        parse_deployments(&text).map_err(PlatformError::Transport)
    }

    /// Opens a redialing log-stream subscription for one deployment.
    /// The returned receiver yields batches as they arrive; dropping it
    /// signals the background task to stop (the `return()`-on-cleanup
    /// contract from spec.md §5).
    pub fn subscribe(&self, deployment_id: String) -> Subscription {
        let (tx, rx) = mpsc::channel(16);
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let token = self.token.clone();
        let shared = self.shared.clone();
        let handle = tokio::spawn(stream_with_backoff(http, base_url, token, deployment_id, shared, tx));
        Subscription { rx, handle }
    }
}

pub struct Subscription {
    rx: mpsc::Receiver<Vec<LogLine>>,
    handle: tokio::task::JoinHandle<()>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Vec<LogLine>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn record_rate_limit_headers(shared: &Arc<Shared>, headers: &reqwest::header::HeaderMap) {
    let parse_i64 = |name: &str| -> Option<i64> {
        headers.get(name)?.to_str().ok()?.parse().ok()
    };
    if let (Some(remaining), Some(limit), Some(resets_at_ms)) = (
        parse_i64("x-ratelimit-remaining"),
        parse_i64("x-ratelimit-limit"),
        parse_i64("x-ratelimit-reset"),
    ) {
        shared
            .rate_limit
            .lock()
            .await
            .update(RateLimitInfo { remaining, limit, resets_at_ms });
    }
}

fn parse_deployments(body: &str) -> Result<Vec<Deployment>, String> {
    #[derive(serde::Deserialize)]
    struct Envelope {
        data: Option<DeploymentsData>,
    }
    #[derive(serde::Deserialize)]
    struct DeploymentsData {
        deployments: Vec<Deployment>,
    }
    let envelope: Envelope = serde_json::from_str(body).map_err(|e| e.to_string())?;
    Ok(envelope.data.map(|d| d.deployments).unwrap_or_default())
}

/// Redials the streaming endpoint with exponential backoff (1s doubling,
/// cap 60s, <=10 attempts) whenever the connection ends, generalizing
/// `ws_forwarder`'s single-socket receive loop to an unbounded series of
/// reconnect attempts. Gives up silently after the attempt cap — the
/// caller observes this as the channel closing.
async fn stream_with_backoff(
    http: reqwest::Client,
    base_url: String,
    token: String,
    deployment_id: String,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Vec<LogLine>>,
) {
    let mut backoff = RECONNECT_BASE;
    let mut attempts = 0u32;

    loop {
        if shared.auth_latch.lock().await.latched {
            return;
        }
        match run_one_stream(&http, &base_url, &token, &deployment_id, &tx).await {
            Ok(()) => {
                attempts = 0;
                backoff = RECONNECT_BASE;
            }
            Err(e) => {
                warn!(deployment_id = %deployment_id, error = %e, "log stream disconnected");
                attempts += 1;
                if attempts > RECONNECT_MAX_ATTEMPTS {
                    warn!(deployment_id = %deployment_id, "giving up reconnecting after max attempts");
                    return;
                }
            }
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, RECONNECT_MAX);
    }
}

async fn run_one_stream(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
    deployment_id: &str,
    tx: &mpsc::Sender<Vec<LogLine>>,
) -> Result<(), String> {
    use futures_util::StreamExt;

    let url = format!("{base_url}/deployments/{deployment_id}/logs/stream");
    let response = http
        .get(&url)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("unexpected status {}", response.status()));
    }

    let mut stream = response.bytes_stream();
    let mut buf = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].to_owned();
            buf.drain(..=pos);
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(batch) = serde_json::from_str::<Vec<LogLine>>(&line) {
                debug!(deployment_id = %deployment_id, lines = batch.len(), "received log batch");
                if tx.send(batch).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_consecutive_failures() {
        let mut b = Breaker::new();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            b.record_failure(0);
        }
        assert_eq!(b.state, BreakerState::Closed);
        b.record_failure(0);
        assert_eq!(b.state, BreakerState::Open);
    }

    #[test]
    fn breaker_moves_to_half_open_after_timeout_then_closes_on_success() {
        let mut b = Breaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            b.record_failure(0);
        }
        assert!(!b.allows_request(30_000));
        assert!(b.allows_request(60_001));
        assert_eq!(b.state, BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.state, BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_breaker() {
        let mut b = Breaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            b.record_failure(0);
        }
        b.allows_request(60_001);
        assert_eq!(b.state, BreakerState::HalfOpen);
        b.record_failure(60_001);
        assert_eq!(b.state, BreakerState::Open);
    }

    #[test]
    fn rate_limit_tracker_flags_depleted_and_unexpired() {
        let mut t = RateLimitTracker::default();
        t.update(RateLimitInfo { remaining: 0, limit: 100, resets_at_ms: 10_000 });
        assert!(t.is_rate_limited(5_000));
        assert!(!t.is_rate_limited(10_001));
    }

    #[test]
    fn auth_error_body_detection_is_case_insensitive() {
        assert!(is_auth_error_body("Request Forbidden"));
        assert!(is_auth_error_body("{\"errors\":[{\"message\":\"Unauthorized access\"}]}"));
        assert!(!is_auth_error_body("ok"));
    }
}
