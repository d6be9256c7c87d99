//! Select+upsert-in-a-transaction dedup of incoming error occurrences
//! (spec.md §4.6). Grounded on `repo/races::replace_participants`'s
//! `pool.begin()` / select-then-write shape.

use errly_protocol::{ErrorGroup, Severity, Source, Status};
use sqlx::SqlitePool;

use crate::store::error_groups::{self, NewErrorInput, UpdateFields};

#[derive(Debug, thiserror::Error)]
pub enum GrouperError {
    #[error(transparent)]
    Store(#[from] sqlx::Error),
    #[error("row for fingerprint {fingerprint} missing immediately after upsert")]
    MissingAfterUpsert { fingerprint: String },
}

#[derive(Debug, Clone)]
pub struct Occurrence {
    pub service: String,
    pub deployment_id: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub severity: Severity,
    pub endpoint: Option<String>,
    pub raw_log: String,
    pub source: Source,
    pub metadata: Option<serde_json::Value>,
}

pub struct ProcessResult {
    pub group: ErrorGroup,
    pub is_new: bool,
}

/// Runs the select+upsert inside a single transaction so that two
/// concurrent arrivals of the same fingerprint cannot both observe
/// "absent" and attempt a duplicate insert (spec.md §4.5 concurrency note).
pub async fn process(
    pool: &SqlitePool,
    occurrence: &Occurrence,
    fingerprint: &str,
    now_ms: i64,
) -> Result<ProcessResult, GrouperError> {
    let mut tx = pool.begin().await?;

    let existing = error_groups::get_by_fingerprint_tx(&mut tx, fingerprint).await?;

    let (group_id, is_new) = match existing {
        None => {
            let input = NewErrorInput {
                service: occurrence.service.clone(),
                deployment_id: occurrence.deployment_id.clone(),
                message: occurrence.message.clone(),
                stack_trace: occurrence.stack_trace.clone(),
                severity: occurrence.severity,
                endpoint: occurrence.endpoint.clone(),
                raw_log: occurrence.raw_log.clone(),
                source: occurrence.source,
                metadata: occurrence.metadata.clone(),
                fingerprint: fingerprint.to_owned(),
            };
            let inserted = error_groups::insert_new_tx(&mut tx, &input, now_ms).await?;
            (inserted.id, true)
        }
        Some(existing) => {
            let severity = existing.severity.max(occurrence.severity);
            let status = if existing.status == Status::Resolved {
                Status::New
            } else {
                existing.status
            };
            let status_changed_at = if status != existing.status {
                now_ms
            } else {
                existing.status_changed_at
            };
            let fields = UpdateFields {
                deployment_id: occurrence.deployment_id.clone(),
                message: occurrence.message.clone(),
                severity,
                endpoint: occurrence.endpoint.clone().or(existing.endpoint.clone()),
                metadata: occurrence.metadata.clone().or(existing.metadata.clone()),
                status,
                status_changed_at,
                last_seen_at: now_ms,
                occurrence_count: existing.occurrence_count + 1,
            };
            error_groups::update_existing_tx(&mut tx, existing.id, &fields).await?;
            (existing.id, false)
        }
    };

    let group = error_groups::get_by_id_tx(&mut tx, group_id)
        .await?
        .ok_or_else(|| GrouperError::MissingAfterUpsert { fingerprint: fingerprint.to_owned() })?;

    tx.commit().await?;

    Ok(ProcessResult { group, is_new })
}

#[cfg(test)]
mod tests {
    use super::*;
    use errly_ingest::fingerprint::fingerprint as compute_fingerprint;

    async fn setup() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn occurrence(severity: Severity) -> Occurrence {
        Occurrence {
            service: "api".to_owned(),
            deployment_id: "dep-1".to_owned(),
            message: "connection refused".to_owned(),
            stack_trace: None,
            severity,
            endpoint: Some("/v1/widgets".to_owned()),
            raw_log: "connection refused".to_owned(),
            source: Source::AutoCapture,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn first_occurrence_is_new_with_count_one() {
        let pool = setup().await;
        let occ = occurrence(Severity::Error);
        let fp = compute_fingerprint(&occ.service, &occ.message, occ.stack_trace.as_deref());

        let result = process(&pool, &occ, &fp, 1_000).await.unwrap();
        assert!(result.is_new);
        assert_eq!(result.group.occurrence_count, 1);
        assert_eq!(result.group.status, Status::New);
    }

    #[tokio::test]
    async fn recurrence_increments_count_and_escalates_severity() {
        let pool = setup().await;
        let occ = occurrence(Severity::Warn);
        let fp = compute_fingerprint(&occ.service, &occ.message, occ.stack_trace.as_deref());

        process(&pool, &occ, &fp, 1_000).await.unwrap();
        let second = process(&pool, &occurrence(Severity::Fatal), &fp, 2_000).await.unwrap();

        assert!(!second.is_new);
        assert_eq!(second.group.occurrence_count, 2);
        assert_eq!(second.group.severity, Severity::Fatal);
        assert_eq!(second.group.last_seen_at, 2_000);
    }

    #[tokio::test]
    async fn resolved_status_reverts_to_new_on_recurrence() {
        let pool = setup().await;
        let occ = occurrence(Severity::Error);
        let fp = compute_fingerprint(&occ.service, &occ.message, occ.stack_trace.as_deref());
        let first = process(&pool, &occ, &fp, 1_000).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        error_groups::update_existing_tx(
            &mut tx,
            first.group.id,
            &UpdateFields {
                deployment_id: first.group.deployment_id.clone(),
                message: first.group.message.clone(),
                severity: first.group.severity,
                endpoint: first.group.endpoint.clone(),
                metadata: first.group.metadata.clone(),
                status: Status::Resolved,
                status_changed_at: 1_500,
                last_seen_at: first.group.last_seen_at,
                occurrence_count: first.group.occurrence_count,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let recurrence = process(&pool, &occ, &fp, 2_000).await.unwrap();
        assert_eq!(recurrence.group.status, Status::New);
        assert_eq!(recurrence.group.status_changed_at, 2_000);
    }

    #[tokio::test]
    async fn non_resolved_status_is_preserved_across_recurrence() {
        let pool = setup().await;
        let occ = occurrence(Severity::Error);
        let fp = compute_fingerprint(&occ.service, &occ.message, occ.stack_trace.as_deref());
        let first = process(&pool, &occ, &fp, 1_000).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        error_groups::update_existing_tx(
            &mut tx,
            first.group.id,
            &UpdateFields {
                deployment_id: first.group.deployment_id.clone(),
                message: first.group.message.clone(),
                severity: first.group.severity,
                endpoint: first.group.endpoint.clone(),
                metadata: first.group.metadata.clone(),
                status: Status::Investigating,
                status_changed_at: 1_500,
                last_seen_at: first.group.last_seen_at,
                occurrence_count: first.group.occurrence_count,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let recurrence = process(&pool, &occ, &fp, 2_000).await.unwrap();
        assert_eq!(recurrence.group.status, Status::Investigating);
        assert_eq!(recurrence.group.status_changed_at, 1_500);
    }
}
