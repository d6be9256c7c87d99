use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::warn;

const SENTINEL_FILE_NAME: &str = ".errly-initialized";

pub async fn create_pool(db_path: &str) -> SqlitePool {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).expect("failed to create data directory");
        }
    }
    check_ephemeral_storage(db_path);

    let url = format!("sqlite://{db_path}?mode=rwc");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("failed to open sqlite store");
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("failed to enable foreign keys");
    pool
}

pub async fn run_migrations(pool: &SqlitePool) {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .expect("failed to run database migrations")
}

/// Persistence layout (spec.md §6): write a sentinel on first successful
/// init; on later boots, if the sentinel is missing and the data directory
/// is otherwise empty, the platform's disk is probably ephemeral and any
/// data written since the last boot was lost.
fn check_ephemeral_storage(db_path: &str) {
    let dir = Path::new(db_path).parent().unwrap_or_else(|| Path::new("."));
    let sentinel = dir.join(SENTINEL_FILE_NAME);

    if sentinel.exists() {
        return;
    }

    let dir_is_empty = std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true);

    if !dir_is_empty {
        warn!(
            path = %dir.display(),
            "storage sentinel missing but data directory is not empty; storage may be ephemeral and data from a prior boot may have been lost"
        );
    }

    let _ = std::fs::write(&sentinel, b"");
}

/// Used by `/health`'s `dbConnected` probe.
pub async fn ping(pool: &SqlitePool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_pool_and_migrate_in_memory() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        run_migrations(&pool).await;
        assert!(ping(&pool).await);
    }
}
