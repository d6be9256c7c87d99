//! Authentication for both dashboard sessions (cookie) and direct log
//! ingestion (`X-Errly-Token` header).
//!
//! Security invariants (spec.md §9): raw tokens are never persisted; secret
//! comparisons always SHA-256-hash both sides first, then compare digests —
//! this sidesteps length-mismatch timing hazards of comparing raw strings
//! directly, and is the generalization of the teacher's `validate_token`
//! (`device_tokens.token_hash` lookup) to a value that isn't looked up by
//! the hash at all (the stored integration token).

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

pub fn sha256_hex(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Constant-time compare of two secrets, each hashed first so that both
/// sides of the comparison always have equal (32-byte) length regardless of
/// the original input lengths.
pub fn constant_time_token_eq(raw_token: &str, expected_raw_token: &str) -> bool {
    let a = Sha256::digest(raw_token.as_bytes());
    let b = Sha256::digest(expected_raw_token.as_bytes());
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

/// Pulls the session cookie's raw value out of a `Cookie` header, per the
/// cookie name used by the (out-of-scope) login surface.
pub fn extract_session_cookie(cookie_header: &str, cookie_name: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == cookie_name).then(|| value.to_owned())
    })
}

/// Looks up a dashboard session by the SHA-256 hex of its raw cookie token
/// (spec.md §3 Session). Returns `true` when the session exists and has not
/// expired.
pub async fn validate_session(pool: &SqlitePool, raw_token: &str, now_ms: i64) -> bool {
    let id = sha256_hex(raw_token);
    let row = sqlx::query("SELECT expires_at FROM sessions WHERE id = ?")
        .bind(&id)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten();
    match row {
        Some(row) => row.get::<i64, _>("expires_at") > now_ms,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_tokens() {
        assert!(constant_time_token_eq("secret", "secret"));
    }

    #[test]
    fn constant_time_eq_rejects_different_length_tokens() {
        assert!(!constant_time_token_eq("short", "a-much-longer-secret"));
    }

    #[test]
    fn extract_bearer_strips_prefix() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("abc123"), None);
    }

    #[test]
    fn extract_session_cookie_finds_named_pair() {
        let header = "theme=dark; errly_session=abc123; other=1";
        assert_eq!(
            extract_session_cookie(header, "errly_session"),
            Some("abc123".to_owned())
        );
        assert_eq!(extract_session_cookie(header, "missing"), None);
    }

    #[tokio::test]
    async fn validate_session_rejects_unknown_and_expired_tokens() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        assert!(!validate_session(&pool, "nope", 1_000).await);

        let id = sha256_hex("good-token");
        sqlx::query("INSERT INTO sessions (id, expires_at) VALUES (?, ?)")
            .bind(&id)
            .bind(2_000i64)
            .execute(&pool)
            .await
            .unwrap();

        assert!(validate_session(&pool, "good-token", 1_000).await);
        assert!(!validate_session(&pool, "good-token", 3_000).await);
    }
}
