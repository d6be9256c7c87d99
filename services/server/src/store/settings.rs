//! Key-value settings: retention window, service display aliases, webhook
//! URL, and the hashed integration token (spec.md §3 "Settings", §6). The
//! integration token is stored as its SHA-256 hex, never in the clear,
//! mirroring `auth`'s rule that raw secrets are never persisted.

use sqlx::{Row, SqlitePool};

pub const KEY_RETENTION_DAYS: &str = "retention_days";
pub const KEY_SERVICE_ALIASES: &str = "service_aliases";
pub const KEY_WEBHOOK_URL: &str = "webhook_url";
pub const KEY_INTEGRATION_TOKEN_HASH: &str = "integration_token_hash";

pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get("value")))
}

pub async fn set(pool: &SqlitePool, key: &str, value: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, key: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM settings WHERE key = ?1")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

/// `retention_days`, clamped and defaulted by the caller
/// (`config::clamp_retention_days`) — this just returns the raw stored value.
pub async fn get_retention_days(pool: &SqlitePool) -> Result<Option<i64>, sqlx::Error> {
    Ok(get(pool, KEY_RETENTION_DAYS)
        .await?
        .and_then(|v| v.parse().ok()))
}

pub async fn set_retention_days(pool: &SqlitePool, days: i64) -> Result<(), sqlx::Error> {
    set(pool, KEY_RETENTION_DAYS, &days.to_string()).await
}

/// Service name -> display alias map, stored as JSON.
pub async fn get_service_aliases(
    pool: &SqlitePool,
) -> Result<std::collections::HashMap<String, String>, sqlx::Error> {
    match get(pool, KEY_SERVICE_ALIASES).await? {
        Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
        None => Ok(std::collections::HashMap::new()),
    }
}

pub async fn set_service_aliases(
    pool: &SqlitePool,
    aliases: &std::collections::HashMap<String, String>,
) -> Result<(), sqlx::Error> {
    let json = serde_json::to_string(aliases).unwrap_or_else(|_| "{}".to_owned());
    set(pool, KEY_SERVICE_ALIASES, &json).await
}

pub async fn get_webhook_url(pool: &SqlitePool) -> Result<Option<String>, sqlx::Error> {
    get(pool, KEY_WEBHOOK_URL).await
}

pub async fn set_webhook_url(pool: &SqlitePool, url: &str) -> Result<(), sqlx::Error> {
    set(pool, KEY_WEBHOOK_URL, url).await
}

pub async fn clear_webhook_url(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    delete(pool, KEY_WEBHOOK_URL).await
}

pub async fn set_integration_token(pool: &SqlitePool, raw_token: &str) -> Result<(), sqlx::Error> {
    let hash = crate::auth::sha256_hex(raw_token);
    set(pool, KEY_INTEGRATION_TOKEN_HASH, &hash).await
}

pub async fn integration_token_matches(
    pool: &SqlitePool,
    raw_token: &str,
) -> Result<bool, sqlx::Error> {
    let stored = get(pool, KEY_INTEGRATION_TOKEN_HASH).await?;
    Ok(match stored {
        Some(hash) => hash == crate::auth::sha256_hex(raw_token),
        None => false,
    })
}
