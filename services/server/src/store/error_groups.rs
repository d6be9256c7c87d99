use errly_protocol::{ErrorGroup, ListFilters, Severity, Source, Status, TimeRange};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewErrorInput {
    pub service: String,
    pub deployment_id: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub severity: Severity,
    pub endpoint: Option<String>,
    pub raw_log: String,
    pub source: Source,
    pub metadata: Option<serde_json::Value>,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct UpdateFields {
    pub deployment_id: String,
    pub message: String,
    pub severity: Severity,
    pub endpoint: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub status: Status,
    pub status_changed_at: i64,
    pub last_seen_at: i64,
    pub occurrence_count: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

fn row_to_group(row: sqlx::sqlite::SqliteRow) -> ErrorGroup {
    let metadata: Option<String> = row.get("metadata");
    ErrorGroup {
        id: row.get::<String, _>("id").parse().unwrap_or_else(|_| Uuid::nil()),
        service: row.get("service"),
        deployment_id: row.get("deployment_id"),
        message: row.get("message"),
        stack_trace: row.get("stack_trace"),
        severity: Severity::parse(&row.get::<String, _>("severity")).unwrap_or(Severity::Error),
        status: Status::parse(&row.get::<String, _>("status")).unwrap_or(Status::New),
        endpoint: row.get("endpoint"),
        raw_log: row.get("raw_log"),
        source: Source::parse(&row.get::<String, _>("source")).unwrap_or(Source::Direct),
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        fingerprint: row.get("fingerprint"),
        first_seen_at: row.get("first_seen_at"),
        last_seen_at: row.get("last_seen_at"),
        occurrence_count: row.get("occurrence_count"),
        status_changed_at: row.get("status_changed_at"),
        created_at: row.get("created_at"),
    }
}

pub async fn get_by_fingerprint_tx(
    tx: &mut SqliteConnection,
    fingerprint: &str,
) -> Result<Option<ErrorGroup>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM error_groups WHERE fingerprint = ?1")
        .bind(fingerprint)
        .fetch_optional(&mut *tx)
        .await?;
    Ok(row.map(row_to_group))
}

pub async fn get_by_id_tx(
    tx: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<ErrorGroup>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM error_groups WHERE id = ?1")
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
    Ok(row.map(row_to_group))
}

pub async fn insert_new_tx(
    tx: &mut SqliteConnection,
    input: &NewErrorInput,
    now_ms: i64,
) -> Result<ErrorGroup, sqlx::Error> {
    let id = Uuid::new_v4();
    let metadata_json = input.metadata.as_ref().map(|v| v.to_string());
    sqlx::query(
        r#"INSERT INTO error_groups
           (id, service, deployment_id, message, stack_trace, severity, status, endpoint,
            raw_log, source, metadata, fingerprint, first_seen_at, last_seen_at,
            occurrence_count, status_changed_at, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'new', ?7, ?8, ?9, ?10, ?11, ?12, ?12, 1, ?12, ?12)"#,
    )
    .bind(id.to_string())
    .bind(&input.service)
    .bind(&input.deployment_id)
    .bind(&input.message)
    .bind(&input.stack_trace)
    .bind(input.severity.as_str())
    .bind(&input.endpoint)
    .bind(&input.raw_log)
    .bind(input.source.as_str())
    .bind(&metadata_json)
    .bind(&input.fingerprint)
    .bind(now_ms)
    .execute(&mut *tx)
    .await?;

    get_by_id_tx(tx, id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn update_existing_tx(
    tx: &mut SqliteConnection,
    id: Uuid,
    fields: &UpdateFields,
) -> Result<(), sqlx::Error> {
    let metadata_json = fields.metadata.as_ref().map(|v| v.to_string());
    sqlx::query(
        r#"UPDATE error_groups
           SET deployment_id = ?1, message = ?2, severity = ?3, endpoint = ?4,
               metadata = ?5, status = ?6, status_changed_at = ?7,
               last_seen_at = ?8, occurrence_count = ?9
           WHERE id = ?10"#,
    )
    .bind(&fields.deployment_id)
    .bind(&fields.message)
    .bind(fields.severity.as_str())
    .bind(&fields.endpoint)
    .bind(&metadata_json)
    .bind(fields.status.as_str())
    .bind(fields.status_changed_at)
    .bind(fields.last_seen_at)
    .bind(fields.occurrence_count)
    .bind(id.to_string())
    .execute(&mut *tx)
    .await?;
    Ok(())
}

pub async fn get_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<ErrorGroup>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM error_groups WHERE id = ?1")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    Ok(row.map(row_to_group))
}

/// Indexed, paginated list with filters (spec.md §4.5). `query` is a
/// free-text substring match over message and stack; `%`/`_` are escaped so
/// user input cannot inject SQL `LIKE` wildcards.
pub async fn list(
    pool: &SqlitePool,
    filters: &ListFilters,
    pagination: Pagination,
    now_ms: i64,
) -> Result<Vec<ErrorGroup>, sqlx::Error> {
    let mut sql = String::from("SELECT * FROM error_groups WHERE 1=1");
    if filters.service.is_some() {
        sql.push_str(" AND service = ?");
    }
    if filters.severity.is_some() {
        sql.push_str(" AND severity = ?");
    }
    if filters.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if filters.time_range.is_some() {
        sql.push_str(" AND last_seen_at >= ?");
    }
    if filters.query.is_some() {
        sql.push_str(" AND (message LIKE ? ESCAPE '\\' OR stack_trace LIKE ? ESCAPE '\\')");
    }
    sql.push_str(" ORDER BY last_seen_at DESC LIMIT ? OFFSET ?");

    let mut q = sqlx::query(&sql);
    if let Some(service) = &filters.service {
        q = q.bind(service);
    }
    if let Some(severity) = filters.severity {
        q = q.bind(severity.as_str());
    }
    if let Some(status) = filters.status {
        q = q.bind(status.as_str());
    }
    if let Some(time_range) = filters.time_range {
        q = q.bind(now_ms - time_range.millis());
    }
    let escaped_query;
    if let Some(query) = &filters.query {
        escaped_query = escape_like_wildcards(query);
        let pattern = format!("%{escaped_query}%");
        q = q.bind(pattern.clone()).bind(pattern);
    }
    q = q.bind(pagination.limit.max(1)).bind(pagination.offset.max(0));

    let rows = q.fetch_all(pool).await?;
    Ok(rows.into_iter().map(row_to_group).collect())
}

/// Escapes `%`, `_`, and the escape character itself for a `LIKE ... ESCAPE '\'` clause.
pub fn escape_like_wildcards(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Other occurrences in the same time window, excluding `group`'s own
/// fingerprint, from any other service, newest first, capped at `limit`.
pub async fn related(
    pool: &SqlitePool,
    group: &ErrorGroup,
    window_minutes: i64,
    limit: i64,
) -> Result<Vec<ErrorGroup>, sqlx::Error> {
    let window_ms = window_minutes.clamp(1, 60) * 60_000;
    let rows = sqlx::query(
        r#"SELECT * FROM error_groups
           WHERE fingerprint != ?1
             AND service != ?2
             AND last_seen_at BETWEEN ?3 AND ?4
           ORDER BY last_seen_at DESC
           LIMIT ?5"#,
    )
    .bind(&group.fingerprint)
    .bind(&group.service)
    .bind(group.last_seen_at - window_ms)
    .bind(group.last_seen_at + window_ms)
    .bind(limit.min(20))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_group).collect())
}

/// Deletes the given ids, returning how many actually existed.
pub async fn delete_by_ids(pool: &SqlitePool, ids: &[Uuid]) -> Result<u64, sqlx::Error> {
    let mut deleted = 0u64;
    let mut tx = pool.begin().await?;
    for id in ids {
        let result = sqlx::query("DELETE FROM error_groups WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        deleted += result.rows_affected();
    }
    tx.commit().await?;
    Ok(deleted)
}

pub async fn delete_all(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM error_groups").execute(pool).await?;
    Ok(result.rows_affected())
}

/// Deletes groups whose `last_seen_at` is older than `retention_days`,
/// returning the deleted ids so the caller (Retention Sweeper) can notify.
pub async fn delete_by_retention(
    pool: &SqlitePool,
    retention_days: i64,
    now_ms: i64,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let cutoff = now_ms - retention_days * 24 * 60 * 60 * 1000;
    let rows = sqlx::query("SELECT id FROM error_groups WHERE last_seen_at < ?1")
        .bind(cutoff)
        .fetch_all(pool)
        .await?;
    let ids: Vec<Uuid> = rows
        .into_iter()
        .filter_map(|r| r.get::<String, _>("id").parse().ok())
        .collect();
    if ids.is_empty() {
        return Ok(ids);
    }
    sqlx::query("DELETE FROM error_groups WHERE last_seen_at < ?1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(ids)
}

pub struct Stats {
    pub total: i64,
    pub new: i64,
    pub investigating: i64,
    pub in_progress: i64,
    pub resolved: i64,
}

pub async fn stats(pool: &SqlitePool) -> Result<Stats, sqlx::Error> {
    let row = sqlx::query(
        r#"SELECT
             COUNT(*) AS total,
             SUM(CASE WHEN status = 'new' THEN 1 ELSE 0 END) AS new,
             SUM(CASE WHEN status = 'investigating' THEN 1 ELSE 0 END) AS investigating,
             SUM(CASE WHEN status = 'in-progress' THEN 1 ELSE 0 END) AS in_progress,
             SUM(CASE WHEN status = 'resolved' THEN 1 ELSE 0 END) AS resolved
           FROM error_groups"#,
    )
    .fetch_one(pool)
    .await?;
    Ok(Stats {
        total: row.get("total"),
        new: row.get::<Option<i64>, _>("new").unwrap_or(0),
        investigating: row.get::<Option<i64>, _>("investigating").unwrap_or(0),
        in_progress: row.get::<Option<i64>, _>("in_progress").unwrap_or(0),
        resolved: row.get::<Option<i64>, _>("resolved").unwrap_or(0),
    })
}

pub async fn list_services(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query("SELECT DISTINCT service FROM error_groups ORDER BY service")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|r| r.get("service")).collect())
}

/// Count of groups that saw an occurrence in the last minute, for the
/// diagnostics endpoint's per-minute error rate.
pub async fn count_recent(pool: &SqlitePool, since_ms: i64) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS recent FROM error_groups WHERE last_seen_at >= ?1")
        .bind(since_ms)
        .fetch_one(pool)
        .await?;
    Ok(row.get("recent"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_like_wildcards_escapes_percent_and_underscore() {
        assert_eq!(escape_like_wildcards("50%_off"), r"50\%\_off");
        assert_eq!(escape_like_wildcards(r"back\slash"), r"back\\slash");
    }

    async fn setup() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_input(fingerprint: &str) -> NewErrorInput {
        NewErrorInput {
            service: "api".to_owned(),
            deployment_id: "dep-1".to_owned(),
            message: "boom".to_owned(),
            stack_trace: None,
            severity: Severity::Error,
            endpoint: None,
            raw_log: "boom".to_owned(),
            source: Source::AutoCapture,
            metadata: None,
            fingerprint: fingerprint.to_owned(),
        }
    }

    #[tokio::test]
    async fn insert_then_get_by_fingerprint_round_trips() {
        let pool = setup().await;
        let mut tx = pool.begin().await.unwrap();
        let inserted = insert_new_tx(&mut tx, &sample_input("fp-1"), 1_000).await.unwrap();
        tx.commit().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let found = get_by_fingerprint_tx(&mut conn, "fp-1").await.unwrap().unwrap();
        assert_eq!(found.id, inserted.id);
        assert_eq!(found.occurrence_count, 1);
        assert_eq!(found.status, Status::New);
    }

    #[tokio::test]
    async fn delete_by_ids_reports_existing_count() {
        let pool = setup().await;
        let mut tx = pool.begin().await.unwrap();
        let a = insert_new_tx(&mut tx, &sample_input("fp-a"), 1_000).await.unwrap();
        tx.commit().await.unwrap();

        let deleted = delete_by_ids(&pool, &[a.id, Uuid::new_v4()]).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn delete_by_retention_removes_stale_groups_and_returns_ids() {
        let pool = setup().await;
        let mut tx = pool.begin().await.unwrap();
        let old = insert_new_tx(&mut tx, &sample_input("fp-old"), 0).await.unwrap();
        tx.commit().await.unwrap();

        let now_ms = 10 * 24 * 60 * 60 * 1000;
        let deleted = delete_by_retention(&pool, 7, now_ms).await.unwrap();
        assert_eq!(deleted, vec![old.id]);
        assert!(get_by_id(&pool, old.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn count_recent_only_counts_groups_seen_since_the_cutoff() {
        let pool = setup().await;
        let mut tx = pool.begin().await.unwrap();
        insert_new_tx(&mut tx, &sample_input("fp-recent"), 60_000).await.unwrap();
        insert_new_tx(&mut tx, &sample_input("fp-old"), 0).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count_recent(&pool, 30_000).await.unwrap(), 1);
        assert_eq!(count_recent(&pool, 0).await.unwrap(), 2);
    }
}
