//! Periodic retention sweep (spec.md §4.9): runs once at startup and then
//! hourly, deleting groups older than the configured retention window and
//! notifying the push hub of what was cleared.

use std::sync::Arc;
use std::time::Duration;

use errly_protocol::PushEvent;
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::pushhub::PushHub;
use crate::store::{error_groups, settings};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_RETENTION_DAYS: i64 = 7;
const COALESCE_THRESHOLD: usize = 100;

pub async fn sweep_once(pool: &SqlitePool, hub: &PushHub, now_ms: i64) {
    let retention_days = match settings::get_retention_days(pool).await {
        Ok(Some(days)) => crate::config::clamp_retention_days(days),
        Ok(None) => DEFAULT_RETENTION_DAYS,
        Err(e) => {
            error!(error = %e, "failed to read retention_days setting, using default");
            DEFAULT_RETENTION_DAYS
        }
    };

    let deleted_ids = match error_groups::delete_by_retention(pool, retention_days, now_ms).await {
        Ok(ids) => ids,
        Err(e) => {
            error!(error = %e, "retention sweep failed");
            return;
        }
    };

    if deleted_ids.is_empty() {
        return;
    }

    info!(count = deleted_ids.len(), retention_days, "retention sweep deleted groups");
    if deleted_ids.len() <= COALESCE_THRESHOLD {
        hub.publish(PushEvent::ErrorCleared { ids: deleted_ids }).await;
    } else {
        hub.publish(PushEvent::BulkCleared {}).await;
    }
}

pub fn spawn(pool: SqlitePool, hub: Arc<PushHub>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        sweep_once(&pool, &hub, chrono::Utc::now().timestamp_millis()).await;

        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await; // first tick fires immediately; startup sweep already ran above
        loop {
            interval.tick().await;
            sweep_once(&pool, &hub, chrono::Utc::now().timestamp_millis()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouper::{self, Occurrence};
    use errly_protocol::{Severity, Source};

    async fn setup() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn sweep_with_no_stale_rows_is_a_no_op() {
        let pool = setup().await;
        let hub = PushHub::new(10);
        sweep_once(&pool, &hub, 0).await;
    }

    #[tokio::test]
    async fn sweep_deletes_stale_rows_and_publishes_error_cleared() {
        let pool = setup().await;
        let hub = PushHub::new(10);
        let sub = hub.subscribe("tok".to_owned()).await.unwrap();

        let occ = Occurrence {
            service: "api".to_owned(),
            deployment_id: "dep-1".to_owned(),
            message: "boom".to_owned(),
            stack_trace: None,
            severity: Severity::Error,
            endpoint: None,
            raw_log: "boom".to_owned(),
            source: Source::AutoCapture,
            metadata: None,
        };
        let fp = errly_ingest::fingerprint("api", "boom", None);
        grouper::process(&pool, &occ, &fp, 0).await.unwrap();

        settings::set_retention_days(&pool, 1).await.unwrap();
        let far_future_ms = 10 * 24 * 60 * 60 * 1000;
        sweep_once(&pool, &hub, far_future_ms).await;

        let mut rx = sub.rx;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, PushEvent::ErrorCleared { .. }));
    }
}
