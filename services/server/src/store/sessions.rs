//! Session persistence backing `auth::validate_session`. Sessions are keyed
//! by the SHA-256 hex of the raw cookie token — the raw token itself is
//! never written to disk (spec.md §9).

use crate::auth::sha256_hex;
use sqlx::SqlitePool;

pub async fn create(pool: &SqlitePool, raw_token: &str, expires_at_ms: i64) -> Result<(), sqlx::Error> {
    let id = sha256_hex(raw_token);
    sqlx::query("INSERT OR REPLACE INTO sessions (id, expires_at) VALUES (?1, ?2)")
        .bind(&id)
        .bind(expires_at_ms)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn destroy(pool: &SqlitePool, raw_token: &str) -> Result<(), sqlx::Error> {
    let id = sha256_hex(raw_token);
    sqlx::query("DELETE FROM sessions WHERE id = ?1")
        .bind(&id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Invalidates every session (e.g. password rotation). Returns how many
/// were removed, so the caller can decide whether a push-hub `auth-expired`
/// broadcast is warranted.
pub async fn destroy_all(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions").execute(pool).await?;
    Ok(result.rows_affected())
}

/// Deletes expired sessions, returning how many were swept.
pub async fn sweep_expired(pool: &SqlitePool, now_ms: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?1")
        .bind(now_ms)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::validate_session;

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
    async fn create_then_destroy_round_trips() {
        let pool = setup().await;
        create(&pool, "tok-1", 10_000).await.unwrap();
        assert!(validate_session(&pool, "tok-1", 5_000).await);

        destroy(&pool, "tok-1").await.unwrap();
        assert!(!validate_session(&pool, "tok-1", 5_000).await);
    }

    #[tokio::test]
    async fn sweep_expired_removes_only_past_sessions() {
        let pool = setup().await;
        create(&pool, "still-valid", 10_000).await.unwrap();
        create(&pool, "already-expired", 1_000).await.unwrap();

        let swept = sweep_expired(&pool, 5_000).await.unwrap();
        assert_eq!(swept, 1);
        assert!(validate_session(&pool, "still-valid", 5_000).await);
        assert!(!validate_session(&pool, "already-expired", 5_000).await);
    }

    #[tokio::test]
    async fn destroy_all_removes_every_session() {
        let pool = setup().await;
        create(&pool, "a", 10_000).await.unwrap();
        create(&pool, "b", 10_000).await.unwrap();

        let removed = destroy_all(&pool).await.unwrap();
        assert_eq!(removed, 2);
        assert!(!validate_session(&pool, "a", 0).await);
    }
}
