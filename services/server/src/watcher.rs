//! Log Watcher (spec.md §4.8): owns the live subscription set for a
//! project, discovers deployments on an adaptive cadence, feeds each
//! line to its deployment's assembler, and restarts zombied streams.
//!
//! Grounded on `ws_forwarder.rs`'s `tokio::select!` receive loop and
//! reconnect-on-drop shape, generalized from one fixed socket to a
//! dynamically diffed set of subscriptions, each driven by its own task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use errly_protocol::{Deployment, DeploymentStatus, LogLine, Severity, Source};
use reqwest::Client;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use errly_ingest::{classify, Assembler};

use crate::grouper::{self, Occurrence};
use crate::platform_client::PlatformClient;
use crate::pushhub::PushHub;
use crate::state::{SubscriptionStatus, WatcherDiagnostics};

const DISCOVERY_BASE: Duration = Duration::from_secs(60);
const DISCOVERY_MAX: Duration = Duration::from_secs(300);
const HEALTH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const ZOMBIE_THRESHOLD_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Open,
    Closed,
}

struct SubscriptionEntry {
    service_name: String,
    state: SubscriptionState,
    last_message_at_ms: i64,
    handle: Option<tokio::task::JoinHandle<()>>,
}

pub struct WatcherConfig {
    pub project_id: String,
    pub environment_name: Option<String>,
    pub self_service_id: Option<String>,
    pub max_subscriptions: usize,
}

pub struct Watcher {
    config: WatcherConfig,
    platform: Arc<PlatformClient>,
    pool: SqlitePool,
    hub: Arc<PushHub>,
    http: Client,
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
    assemblers: Mutex<HashMap<String, Assembler>>,
    discovery_interval_ms: Mutex<i64>,
    diagnostics: Arc<RwLock<WatcherDiagnostics>>,
}

impl Watcher {
    pub fn new(config: WatcherConfig, platform: Arc<PlatformClient>, pool: SqlitePool, hub: Arc<PushHub>) -> Arc<Self> {
        Self::new_with_diagnostics(
            config,
            platform,
            pool,
            hub,
            Client::new(),
            Arc::new(RwLock::new(WatcherDiagnostics::default())),
        )
    }

    /// Shares the same diagnostics snapshot `/health`/`/api/diagnostics`
    /// read from `AppState`, so discovery ticks are visible without the
    /// HTTP layer needing a direct handle into the watcher itself. `http`
    /// is the same shared client `AppState` uses for webhook dispatch.
    pub fn new_with_diagnostics(
        config: WatcherConfig,
        platform: Arc<PlatformClient>,
        pool: SqlitePool,
        hub: Arc<PushHub>,
        http: Client,
        diagnostics: Arc<RwLock<WatcherDiagnostics>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            platform,
            pool,
            hub,
            http,
            subscriptions: Mutex::new(HashMap::new()),
            assemblers: Mutex::new(HashMap::new()),
            discovery_interval_ms: Mutex::new(DISCOVERY_BASE.as_millis() as i64),
            diagnostics,
        })
    }

    /// Filters to the active-status set, then keeps only the first active
    /// deployment per (service, environment), applies the environment
    /// filter and self-exclusion (spec.md §4.8 step 2-3).
    fn select_desired(&self, deployments: Vec<Deployment>) -> Vec<Deployment> {
        let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
        let mut desired = Vec::new();
        for deployment in deployments {
            if !deployment.status.is_active() {
                continue;
            }
            if let Some(env) = &self.config.environment_name {
                if &deployment.environment_name != env {
                    continue;
                }
            }
            if let Some(self_id) = &self.config.self_service_id {
                if &deployment.deployment_id == self_id {
                    continue;
                }
            }
            let key = (deployment.service_name.clone(), deployment.environment_name.clone());
            if seen.insert(key) {
                desired.push(deployment);
            }
        }
        desired
    }

    async fn run_discovery_tick(self: &Arc<Self>) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        if self.platform.is_breaker_open(now_ms).await || self.platform.has_auth_error().await {
            self.raise_discovery_interval().await;
            return;
        }

        let deployments = match self.platform.list_deployments(&self.config.project_id, now_ms).await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "discovery tick failed");
                self.raise_discovery_interval().await;
                return;
            }
        };

        let desired = self.select_desired(deployments);
        self.reconcile(desired).await;
        self.adapt_discovery_interval_on_success().await;

        let active = self.active_subscription_count().await;
        let subscriptions = self.subscription_statuses().await;
        let mut diagnostics = self.diagnostics.write().await;
        diagnostics.active_subscriptions = active;
        diagnostics.last_discovery_at_ms = Some(now_ms);
        diagnostics.subscriptions = subscriptions;
    }

    async fn raise_discovery_interval(&self) {
        let mut interval_ms = self.discovery_interval_ms.lock().await;
        *interval_ms = (*interval_ms * 2).min(DISCOVERY_MAX.as_millis() as i64);
    }

    async fn adapt_discovery_interval_on_success(&self) {
        let mut interval_ms = self.discovery_interval_ms.lock().await;
        match self.platform.rate_limit_info().await {
            Some(info) if info.limit > 0 => {
                let ratio = info.remaining as f64 / info.limit as f64;
                if ratio < 0.2 {
                    *interval_ms = (*interval_ms * 2).min(DISCOVERY_MAX.as_millis() as i64);
                } else if ratio > 0.5 {
                    *interval_ms = DISCOVERY_BASE.as_millis() as i64;
                }
            }
            _ => {
                *interval_ms = DISCOVERY_BASE.as_millis() as i64;
            }
        }
    }

    /// Diffs the desired deployment set against current subscriptions:
    /// closes what's no longer desired, reopens anything closed, and opens
    /// new subscriptions up to the configured cap (spec.md §4.8 step 4).
    async fn reconcile(self: &Arc<Self>, desired: Vec<Deployment>) {
        let desired_ids: std::collections::HashSet<String> =
            desired.iter().map(|d| d.deployment_id.clone()).collect();

        let to_close: Vec<String> = {
            let subs = self.subscriptions.lock().await;
            subs.keys()
                .filter(|id| !desired_ids.contains(*id))
                .cloned()
                .collect()
        };
        for id in to_close {
            self.close_subscription(&id).await;
        }

        for deployment in desired {
            let should_open = {
                let subs = self.subscriptions.lock().await;
                match subs.get(&deployment.deployment_id) {
                    Some(entry) => entry.state == SubscriptionState::Closed,
                    None => true,
                }
            };
            if !should_open {
                continue;
            }
            let at_capacity = self.subscriptions.lock().await.len() >= self.config.max_subscriptions;
            if at_capacity {
                warn!(max = self.config.max_subscriptions, "subscription cap reached, skipping remaining deployments");
                break;
            }
            self.open_subscription(deployment).await;
        }
    }

    async fn close_subscription(&self, deployment_id: &str) {
        let mut subs = self.subscriptions.lock().await;
        if let Some(mut entry) = subs.remove(deployment_id) {
            if let Some(handle) = entry.handle.take() {
                handle.abort();
            }
        }
        self.assemblers.lock().await.remove(deployment_id);
    }

    async fn open_subscription(self: &Arc<Self>, deployment: Deployment) {
        info!(deployment_id = %deployment.deployment_id, service = %deployment.service_name, "opening log subscription");
        let watcher = self.clone();
        let deployment_id = deployment.deployment_id.clone();
        let service_name = deployment.service_name.clone();
        let handle = tokio::spawn(async move {
            watcher.clone().drive_subscription(deployment_id, service_name).await;
        });

        let mut subs = self.subscriptions.lock().await;
        subs.insert(
            deployment.deployment_id.clone(),
            SubscriptionEntry {
                service_name: deployment.service_name,
                state: SubscriptionState::Open,
                last_message_at_ms: chrono::Utc::now().timestamp_millis(),
                handle: Some(handle),
            },
        );
    }

    async fn drive_subscription(self: Arc<Self>, deployment_id: String, service_name: String) {
        let mut subscription = self.platform.subscribe(deployment_id.clone());
        while let Some(batch) = subscription.recv().await {
            self.consume_batch(&deployment_id, &service_name, batch).await;
        }
    }

    /// For each line, feed the per-deployment assembler; if it produces
    /// nothing and isn't mid-collection, fall back to the platform's
    /// line-level severity metadata (spec.md §4.8 "Consuming a subscription").
    async fn consume_batch(&self, deployment_id: &str, service_name: &str, batch: Vec<LogLine>) {
        if let Some(entry) = self.subscriptions.lock().await.get_mut(deployment_id) {
            entry.last_message_at_ms = chrono::Utc::now().timestamp_millis();
        }

        let mut assemblers = self.assemblers.lock().await;
        let assembler = assemblers.entry(deployment_id.to_owned()).or_insert_with(Assembler::new);

        for line in batch {
            if let Some(completed) = assembler.feed(&line.message, line.timestamp_ms) {
                self.ingest_completed(service_name, deployment_id, &completed.joined(), line.timestamp_ms)
                    .await;
                continue;
            }
            if assembler.state() != errly_ingest::AssemblerState::Collecting {
                if let Some(severity) = platform_severity_fallback(&line) {
                    self.ingest_direct(service_name, deployment_id, &line.message, severity, line.timestamp_ms)
                        .await;
                }
            }
        }
    }

    async fn ingest_completed(&self, service: &str, deployment_id: &str, joined: &str, now_ms: i64) {
        let classification = classify::classify(joined);
        if !classification.is_error {
            return;
        }
        let severity = classification.severity.unwrap_or(Severity::Error);
        self.dispatch_occurrence(service, deployment_id, &classification.message, Some(joined.to_owned()), severity, classification.endpoint, now_ms)
            .await;
    }

    async fn ingest_direct(&self, service: &str, deployment_id: &str, message: &str, severity: Severity, now_ms: i64) {
        self.dispatch_occurrence(service, deployment_id, message, None, severity, None, now_ms).await;
    }

    async fn dispatch_occurrence(
        &self,
        service: &str,
        deployment_id: &str,
        message: &str,
        stack_trace: Option<String>,
        severity: Severity,
        endpoint: Option<String>,
        now_ms: i64,
    ) {
        let occurrence = Occurrence {
            service: service.to_owned(),
            deployment_id: deployment_id.to_owned(),
            message: message.to_owned(),
            stack_trace: stack_trace.clone(),
            severity,
            endpoint,
            raw_log: stack_trace.unwrap_or_else(|| message.to_owned()),
            source: Source::AutoCapture,
            metadata: None,
        };
        let fingerprint = errly_ingest::fingerprint(service, message, occurrence.stack_trace.as_deref());

        match grouper::process(&self.pool, &occurrence, &fingerprint, now_ms).await {
            Ok(result) => {
                let event = if result.is_new {
                    errly_protocol::PushEvent::NewError(Box::new(result.group.clone()))
                } else {
                    errly_protocol::PushEvent::ErrorUpdated(Box::new(result.group.clone()))
                };
                self.hub.publish(event).await;

                if result.is_new {
                    if let Ok(Some(webhook_url)) = crate::store::settings::get_webhook_url(&self.pool).await {
                        crate::webhook::dispatch_new_error(&self.http, &webhook_url, &result.group, now_ms).await;
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "error grouper failed for auto-captured occurrence");
            }
        }
    }

    /// Every 5 minutes: restart subscriptions that have gone silent for
    /// more than 10 minutes, and drop assemblers for deployments no longer
    /// subscribed (spec.md §4.8 health monitor).
    pub async fn run_health_check(self: &Arc<Self>) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let zombies: Vec<(String, String)> = {
            let subs = self.subscriptions.lock().await;
            subs.iter()
                .filter(|(_, entry)| {
                    entry.state != SubscriptionState::Closed && now_ms - entry.last_message_at_ms > ZOMBIE_THRESHOLD_MS
                })
                .map(|(id, entry)| (id.clone(), entry.service_name.clone()))
                .collect()
        };
        for (deployment_id, service_name) in zombies {
            warn!(deployment_id = %deployment_id, "subscription went silent, reopening");
            self.close_subscription(&deployment_id).await;
            self.open_subscription(Deployment {
                deployment_id,
                service_name,
                environment_name: self.config.environment_name.clone().unwrap_or_default(),
                status: DeploymentStatus::Success,
            })
            .await;
        }

        let subscribed_ids: std::collections::HashSet<String> =
            self.subscriptions.lock().await.keys().cloned().collect();
        self.assemblers
            .lock()
            .await
            .retain(|id, _| subscribed_ids.contains(id));
    }

    pub async fn active_subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    async fn subscription_statuses(&self) -> Vec<SubscriptionStatus> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .map(|(deployment_id, entry)| SubscriptionStatus {
                deployment_id: deployment_id.clone(),
                service_name: entry.service_name.clone(),
                state: match entry.state {
                    SubscriptionState::Open => "open",
                    SubscriptionState::Closed => "closed",
                },
                last_message_at_ms: entry.last_message_at_ms,
            })
            .collect()
    }
}

fn platform_severity_fallback(line: &LogLine) -> Option<Severity> {
    let severity = line.severity.as_deref()?.to_lowercase();
    let mapped = match severity.as_str() {
        "warn" | "warning" => Severity::Warn,
        "error" => Severity::Error,
        "fatal" | "critical" => Severity::Fatal,
        _ => return None,
    };
    // A message body that explicitly says info/debug/trace wins over
    // whatever the platform reported out of band (spec.md §4.8).
    if classify::is_structured_non_error(&line.message) {
        return None;
    }
    let classification = classify::classify(&line.message);
    if let Some(reported) = classification.severity {
        if reported < mapped && classification.is_error {
            return None;
        }
    }
    Some(mapped)
}

/// Spawns the discovery and health-monitor timer loops.
pub fn spawn(watcher: Arc<Watcher>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let discovery_watcher = watcher.clone();
    let discovery = tokio::spawn(async move {
        loop {
            discovery_watcher.run_discovery_tick().await;
            let interval_ms = *discovery_watcher.discovery_interval_ms.lock().await;
            tokio::time::sleep(Duration::from_millis(interval_ms as u64)).await;
        }
    });

    let health_watcher = watcher;
    let health = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_INTERVAL);
        loop {
            interval.tick().await;
            health_watcher.run_health_check().await;
        }
    });

    (discovery, health)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(id: &str, service: &str, env: &str, status: DeploymentStatus) -> Deployment {
        Deployment {
            deployment_id: id.to_owned(),
            service_name: service.to_owned(),
            environment_name: env.to_owned(),
            status,
        }
    }

    async fn watcher_for_selection(environment_name: Option<&str>, self_service_id: Option<&str>) -> Arc<Watcher> {
        let platform = Arc::new(PlatformClient::new("https://platform.invalid".to_owned(), "token".to_owned()));
        let hub = PushHub::new(10);
        let config = WatcherConfig {
            project_id: "proj".to_owned(),
            environment_name: environment_name.map(str::to_owned),
            self_service_id: self_service_id.map(str::to_owned),
            max_subscriptions: 50,
        };
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Watcher::new(config, platform, pool, hub)
    }

    #[tokio::test]
    async fn select_desired_keeps_first_active_per_service_and_filters_self() {
        let watcher = watcher_for_selection(Some("production"), Some("dep-self")).await;
        let deployments = vec![
            deployment("dep-1", "api", "production", DeploymentStatus::Success),
            deployment("dep-2", "api", "production", DeploymentStatus::Deploying),
            deployment("dep-3", "worker", "staging", DeploymentStatus::Success),
            deployment("dep-self", "api", "production", DeploymentStatus::Success),
            deployment("dep-4", "api", "production", DeploymentStatus::Crashed),
        ];
        let desired = watcher.select_desired(deployments);
        let ids: Vec<&str> = desired.iter().map(|d| d.deployment_id.as_str()).collect();
        assert_eq!(ids, vec!["dep-1"]);
    }

    #[tokio::test]
    async fn subscription_statuses_reflects_the_live_subscription_map() {
        let watcher = watcher_for_selection(None, None).await;
        watcher.subscriptions.lock().await.insert(
            "dep-1".to_owned(),
            SubscriptionEntry {
                service_name: "api".to_owned(),
                state: SubscriptionState::Open,
                last_message_at_ms: 1_000,
                handle: None,
            },
        );

        let statuses = watcher.subscription_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].deployment_id, "dep-1");
        assert_eq!(statuses[0].service_name, "api");
        assert_eq!(statuses[0].state, "open");
        assert_eq!(statuses[0].last_message_at_ms, 1_000);
    }

    #[tokio::test]
    async fn dispatch_occurrence_creates_a_group_with_no_webhook_configured() {
        let watcher = watcher_for_selection(None, None).await;
        watcher
            .dispatch_occurrence("api", "dep-1", "connection refused", None, Severity::Error, None, 0)
            .await;

        let groups = crate::store::error_groups::list(
            &watcher.pool,
            &errly_protocol::ListFilters::default(),
            crate::store::error_groups::Pagination { limit: 10, offset: 0 },
            0,
        )
        .await
        .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].service, "api");
    }

    #[test]
    fn platform_severity_fallback_maps_known_levels() {
        let line = LogLine { message: "something odd".to_owned(), timestamp_ms: 0, severity: Some("warning".to_owned()) };
        assert_eq!(platform_severity_fallback(&line), Some(Severity::Warn));
    }

    #[test]
    fn platform_severity_fallback_ignores_unknown_levels() {
        let line = LogLine { message: "something odd".to_owned(), timestamp_ms: 0, severity: Some("trace".to_owned()) };
        assert_eq!(platform_severity_fallback(&line), None);
    }

    #[test]
    fn platform_severity_fallback_suppressed_by_contradictory_structured_level() {
        let line = LogLine {
            message: "{\"level\":\"info\",\"msg\":\"ok\"}".to_owned(),
            timestamp_ms: 0,
            severity: Some("error".to_owned()),
        };
        assert_eq!(platform_severity_fallback(&line), None);
    }
}
