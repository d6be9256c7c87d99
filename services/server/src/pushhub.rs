//! Per-client dashboard push registry (spec.md §4.7).
//!
//! Grounded on `http/sse.rs`'s `Sse<impl Stream<...>>` / `KeepAlive` shape
//! and `dashboard_events.rs`'s tagged JSON event enum, generalized from one
//! global broadcast channel to a per-client registry: a broadcast channel
//! cannot track per-subscriber lag precisely enough for the `droppedMessages`
//! counter this spec requires, since a lagged receiver only learns "you
//! missed N messages" after the fact, not before each individual send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use errly_protocol::PushEvent;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

const DROP_EVICTION_THRESHOLD: u64 = 50;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const REVALIDATION_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CLIENT_CHANNEL_CAPACITY: usize = 64;

struct Client {
    tx: mpsc::Sender<PushEvent>,
    raw_session_token: String,
    dropped: AtomicU64,
}

pub struct PushHub {
    clients: RwLock<HashMap<Uuid, Client>>,
    max_clients: usize,
}

pub struct Subscriber {
    pub client_id: Uuid,
    pub rx: mpsc::Receiver<PushEvent>,
}

impl PushHub {
    pub fn new(max_clients: usize) -> Arc<Self> {
        Arc::new(Self { clients: RwLock::new(HashMap::new()), max_clients })
    }

    /// Admits a new dashboard client. `None` when at capacity — the caller
    /// maps this to a 503 (spec.md §4.7).
    pub async fn subscribe(&self, raw_session_token: String) -> Option<Subscriber> {
        let mut clients = self.clients.write().await;
        if clients.len() >= self.max_clients {
            return None;
        }
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        clients.insert(client_id, Client { tx, raw_session_token, dropped: AtomicU64::new(0) });
        Some(Subscriber { client_id, rx })
    }

    pub async fn unsubscribe(&self, client_id: Uuid) {
        self.clients.write().await.remove(&client_id);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Non-blocking publish to every live client. A full channel increments
    /// that client's drop counter; beyond the threshold the client is
    /// evicted outright (spec.md §4.7 backpressure policy).
    pub async fn publish(&self, event: PushEvent) {
        let mut to_evict = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, client) in clients.iter() {
                match client.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let dropped = client.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped > DROP_EVICTION_THRESHOLD {
                            to_evict.push(*id);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        to_evict.push(*id);
                    }
                }
            }
        }
        if !to_evict.is_empty() {
            let mut clients = self.clients.write().await;
            for id in to_evict {
                clients.remove(&id);
            }
        }
    }

    /// Every 5 minutes, drop any client whose session has expired or
    /// vanished, sending `auth-expired` first.
    pub async fn revalidate_sessions(&self, pool: &SqlitePool, now_ms: i64) {
        let stale: Vec<Uuid> = {
            let clients = self.clients.read().await;
            let mut stale = Vec::new();
            for (id, client) in clients.iter() {
                if !crate::auth::validate_session(pool, &client.raw_session_token, now_ms).await {
                    let _ = client.tx.try_send(PushEvent::AuthExpired {});
                    stale.push(*id);
                }
            }
            stale
        };
        if !stale.is_empty() {
            let mut clients = self.clients.write().await;
            for id in stale {
                clients.remove(&id);
            }
        }
    }

    /// Broadcasts `auth-expired` to every client then clears the registry
    /// (spec.md §4.7 shutdown contract).
    pub async fn shutdown(&self) {
        let mut clients = self.clients.write().await;
        for client in clients.values() {
            let _ = client.tx.try_send(PushEvent::AuthExpired {});
        }
        clients.clear();
    }
}

/// Spawns the periodic session-revalidation task.
pub fn spawn_revalidation_task(hub: Arc<PushHub>, pool: SqlitePool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REVALIDATION_INTERVAL);
        loop {
            interval.tick().await;
            let now_ms = chrono::Utc::now().timestamp_millis();
            hub.revalidate_sessions(&pool, now_ms).await;
        }
    })
}

/// Keepalive comment frames every 30s so idle proxies do not close the
/// stream; returns the interval for the handler's `tokio::select!` loop.
pub fn keepalive_interval() -> tokio::time::Interval {
    tokio::time::interval(KEEPALIVE_INTERVAL)
}

pub fn warn_subscription_rejected(reason: &str) {
    warn!(reason, "dashboard subscription rejected");
}
