//! Blob storage collaborator interface.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutResult {
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, opts: &PutOptions) -> anyhow::Result<PutResult>;

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// A time-limited download URL for `key`.
    async fn presign_get(&self, key: &str, ttl: Duration) -> anyhow::Result<String>;
}

/// Map-backed object store for tests.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _opts: &PutOptions) -> anyhow::Result<PutResult> {
        let etag = format!("{:x}", Sha256::digest(&bytes));
        self.objects
            .write()
            .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?
            .insert(key.to_string(), bytes);
        Ok(PutResult { etag })
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.objects
            .read()
            .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("object not found: {}", key))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.objects
            .write()
            .map_err(|_| anyhow::anyhow!("object store lock poisoned"))?
            .remove(key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> anyhow::Result<String> {
        Ok(format!("memory://{}?expires_in={}", key, ttl.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryObjectStore::new();
        let put = store
            .put("a/b.txt", b"hello".to_vec(), &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(put.etag.len(), 64);
        assert_eq!(store.get("a/b.txt").await.unwrap(), b"hello");
        store.delete("a/b.txt").await.unwrap();
        assert!(store.get("a/b.txt").await.is_err());
    }
}
