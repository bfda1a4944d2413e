//! Lock helpers over the [`Locker`] collaborator, and the SQLite-backed
//! locker shared by every process that opens the same database.
//!
//! [`Locker::acquire`] is a single attempt. Callers wait for a lock with
//! [`acquire_with_retry`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::warn;

use llmops_core::lock::Locker;
use llmops_core::models::new_id;
use llmops_core::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll `key` until it is acquired or `timeout` elapses. Returns the owner
/// token.
pub async fn acquire_with_retry(
    locker: &dyn Locker,
    key: &str,
    ttl: Duration,
    timeout: Duration,
) -> Result<String> {
    let deadline = Instant::now() + timeout;
    loop {
        let token = locker.acquire(key, ttl).await?;
        if !token.is_empty() {
            return Ok(token);
        }
        if Instant::now() >= deadline {
            return Err(Error::transient(format!(
                "timed out after {:?} waiting for lock {}",
                timeout, key
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Release a lock, logging instead of failing.
pub async fn release_quietly(locker: &dyn Locker, key: &str, token: &str) {
    match locker.release(key, token).await {
        Ok(true) => {}
        Ok(false) => warn!(key, "lock expired before release"),
        Err(e) => warn!(key, error = %e, "failed to release lock"),
    }
}

/// Locks stored in the `locks` table.
///
/// Acquire is a single upsert that only overwrites an expired row; release
/// deletes the row only while the token still matches. Expiry uses
/// wall-clock milliseconds, so every process sharing the file agrees.
pub struct SqliteLocker {
    pool: SqlitePool,
}

impl SqliteLocker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Locker for SqliteLocker {
    async fn acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<String> {
        let now = chrono::Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let token = new_id();
        let taken = sqlx::query(
            r#"
            INSERT INTO locks (key, token, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                token = excluded.token,
                expires_at = excluded.expires_at
            WHERE locks.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(&token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(if taken == 1 { token } else { String::new() })
    }

    async fn release(&self, key: &str, token: &str) -> anyhow::Result<bool> {
        let removed = sqlx::query("DELETE FROM locks WHERE key = ? AND token = ?")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmops_core::lock::InMemoryLocker;
    use llmops_core::ErrorKind;

    #[tokio::test]
    async fn test_acquire_with_retry_waits_for_release() {
        let locker = std::sync::Arc::new(InMemoryLocker::new());
        let held = locker
            .acquire("k", Duration::from_secs(30))
            .await
            .unwrap();

        let waiter = {
            let locker = locker.clone();
            tokio::spawn(async move {
                acquire_with_retry(
                    locker.as_ref(),
                    "k",
                    Duration::from_secs(30),
                    Duration::from_secs(5),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        release_quietly(locker.as_ref(), "k", &held).await;

        let token = waiter.await.unwrap().unwrap();
        assert!(!token.is_empty());
        assert_ne!(token, held);
    }

    async fn sqlite_locker(dir: &tempfile::TempDir) -> SqliteLocker {
        let pool = crate::db::connect_path(&dir.path().join("locks.sqlite"))
            .await
            .unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        SqliteLocker::new(pool)
    }

    #[tokio::test]
    async fn test_sqlite_locker_excludes_second_holder() {
        let dir = tempfile::TempDir::new().unwrap();
        let locker = sqlite_locker(&dir).await;
        let ttl = Duration::from_secs(30);

        let token = locker.acquire("k", ttl).await.unwrap();
        assert!(!token.is_empty());
        assert_eq!(locker.acquire("k", ttl).await.unwrap(), "");
        assert!(!locker.acquire("other", ttl).await.unwrap().is_empty());

        assert!(!locker.release("k", "not-the-owner").await.unwrap());
        assert_eq!(locker.acquire("k", ttl).await.unwrap(), "");
        assert!(locker.release("k", &token).await.unwrap());
        assert!(!locker.acquire("k", ttl).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_locker_takes_over_expired_lock() {
        let dir = tempfile::TempDir::new().unwrap();
        let locker = sqlite_locker(&dir).await;

        let stale = locker.acquire("k", Duration::ZERO).await.unwrap();
        assert!(!stale.is_empty());
        let fresh = locker.acquire("k", Duration::from_secs(30)).await.unwrap();
        assert!(!fresh.is_empty());
        assert_ne!(fresh, stale);

        // The expired holder cannot release its successor's lock.
        assert!(!locker.release("k", &stale).await.unwrap());
        assert!(locker.release("k", &fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_with_retry_times_out() {
        let locker = InMemoryLocker::new();
        locker.acquire("k", Duration::from_secs(30)).await.unwrap();
        let err = acquire_with_retry(
            &locker,
            "k",
            Duration::from_secs(30),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
