//! Distributed-lock collaborator interface.
//!
//! A lock is a key holding an opaque owner token with an expiry.
//! [`Locker::acquire`] returns the token on success and an empty string
//! when the key is held by someone else. [`Locker::release`] is a
//! compare-and-delete: it only removes the key when the token matches,
//! so a holder whose lock expired cannot release its successor's lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::models::new_id;

/// Key guarding every keyword-table mutation for a dataset.
pub fn keyword_table_lock_key(dataset_id: &str) -> String {
    format!("lock:keyword_table:{}", dataset_id)
}

/// Key held across a full document enable toggle.
pub fn document_enabled_lock_key(document_id: &str) -> String {
    format!("lock:document:update:enabled_{}", document_id)
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Try once to take `key` for `ttl`. Returns the owner token, or `""`
    /// when the key is currently held.
    async fn acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<String>;

    /// Delete `key` if it is still owned by `token`. Returns whether a
    /// lock was removed.
    async fn release(&self, key: &str, token: &str) -> anyhow::Result<bool>;
}

/// Process-local locker with TTL expiry.
#[derive(Default)]
pub struct InMemoryLocker {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Locker for InMemoryLocker {
    async fn acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<String> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow::anyhow!("locker mutex poisoned"))?;
        let now = Instant::now();
        if let Some((_, expires)) = held.get(key) {
            if *expires > now {
                return Ok(String::new());
            }
        }
        let token = new_id();
        held.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(token)
    }

    async fn release(&self, key: &str, token: &str) -> anyhow::Result<bool> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow::anyhow!("locker mutex poisoned"))?;
        match held.get(key) {
            Some((owner, _)) if owner == token => {
                held.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let locker = InMemoryLocker::new();
        let key = keyword_table_lock_key("ds1");
        let token = locker.acquire(&key, Duration::from_secs(30)).await.unwrap();
        assert!(!token.is_empty());
        let second = locker.acquire(&key, Duration::from_secs(30)).await.unwrap();
        assert!(second.is_empty());
        assert!(locker.release(&key, &token).await.unwrap());
        let third = locker.acquire(&key, Duration::from_secs(30)).await.unwrap();
        assert!(!third.is_empty());
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let locker = InMemoryLocker::new();
        let token = locker.acquire("k", Duration::from_secs(30)).await.unwrap();
        assert!(!locker.release("k", "someone-else").await.unwrap());
        assert!(locker.acquire("k", Duration::from_secs(30)).await.unwrap().is_empty());
        assert!(locker.release("k", &token).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_and_stale_owner_cannot_release() {
        let locker = InMemoryLocker::new();
        let stale = locker.acquire("k", Duration::from_millis(0)).await.unwrap();
        let fresh = locker.acquire("k", Duration::from_secs(30)).await.unwrap();
        assert!(!fresh.is_empty());
        assert!(!locker.release("k", &stale).await.unwrap());
        assert!(locker.release("k", &fresh).await.unwrap());
    }

    #[test]
    fn test_lock_keys() {
        assert_eq!(keyword_table_lock_key("d"), "lock:keyword_table:d");
        assert_eq!(
            document_enabled_lock_key("x"),
            "lock:document:update:enabled_x"
        );
    }
}
