//! Per-dataset keyword table maintenance.
//!
//! Every mutation runs under `lock:keyword_table:<dataset_id>` and rewrites
//! the whole row. Reads go straight to the store without the lock.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use llmops_core::lock::{keyword_table_lock_key, Locker};
use llmops_core::models::{now_ts, KeywordTable};
use llmops_core::store::{KeywordTableStore, SegmentStore, Store};
use llmops_core::Result;

use crate::config::LocksConfig;
use crate::lock::{acquire_with_retry, release_quietly};

pub struct KeywordTableService {
    store: Arc<dyn Store>,
    locker: Arc<dyn Locker>,
    ttl: Duration,
    acquire_timeout: Duration,
}

impl KeywordTableService {
    pub fn new(store: Arc<dyn Store>, locker: Arc<dyn Locker>, locks: &LocksConfig) -> Self {
        Self {
            store,
            locker,
            ttl: Duration::from_secs(locks.keyword_table_ttl_secs),
            acquire_timeout: Duration::from_secs(locks.acquire_timeout_secs),
        }
    }

    /// The dataset's table, inserting an empty row on first access.
    pub async fn get_or_create(&self, dataset_id: &str) -> Result<KeywordTable> {
        if let Some(table) = self.store.get_keyword_table(dataset_id).await? {
            return Ok(table);
        }
        let table = KeywordTable::empty(dataset_id);
        self.store.save_keyword_table(&table).await?;
        Ok(table)
    }

    /// Add the listed segments' keywords to the dataset's table.
    ///
    /// Any stale postings for those segments are dropped first, so a
    /// segment whose keywords changed does not linger under old keys.
    pub async fn add(&self, dataset_id: &str, segment_ids: &[String]) -> Result<()> {
        if segment_ids.is_empty() {
            return Ok(());
        }
        let segments = self
            .store
            .list_segments_by_ids(segment_ids, &[dataset_id.to_string()])
            .await?;

        self.with_table(dataset_id, |table| {
            table.remove(segment_ids);
            // Preserve caller order for stable postings.
            for id in segment_ids {
                if let Some(segment) = segments.iter().find(|s| &s.id == id) {
                    table.add(&segment.id, &segment.keywords);
                }
            }
        })
        .await?;
        debug!(dataset_id, count = segment_ids.len(), "keyword postings added");
        Ok(())
    }

    /// Remove the listed segment IDs from every posting list.
    pub async fn remove(&self, dataset_id: &str, segment_ids: &[String]) -> Result<()> {
        if segment_ids.is_empty() {
            return Ok(());
        }
        self.with_table(dataset_id, |table| table.remove(segment_ids))
            .await?;
        debug!(dataset_id, count = segment_ids.len(), "keyword postings removed");
        Ok(())
    }

    async fn with_table<F>(&self, dataset_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut KeywordTable),
    {
        let key = keyword_table_lock_key(dataset_id);
        let token =
            acquire_with_retry(self.locker.as_ref(), &key, self.ttl, self.acquire_timeout).await?;

        let result: Result<()> = async {
            let mut table = self.get_or_create(dataset_id).await?;
            mutate(&mut table);
            table.updated_at = now_ts();
            self.store.save_keyword_table(&table).await?;
            Ok(())
        }
        .await;

        release_quietly(self.locker.as_ref(), &key, &token).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmops_core::lock::InMemoryLocker;
    use llmops_core::models::{new_id, Segment, SegmentStatus};
    use llmops_core::store::memory::InMemoryStore;

    fn segment(dataset_id: &str, position: i64, keywords: &[&str]) -> Segment {
        Segment {
            id: new_id(),
            account_id: "acct".into(),
            dataset_id: dataset_id.into(),
            document_id: "doc".into(),
            position,
            content: String::new(),
            character_count: 0,
            token_count: 0,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            hash: String::new(),
            node_id: new_id(),
            hit_count: 0,
            enabled: true,
            disabled_at: None,
            processing_started_at: None,
            indexing_completed_at: None,
            completed_at: None,
            stopped_at: None,
            error: String::new(),
            status: SegmentStatus::Completed,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn service(store: Arc<InMemoryStore>) -> KeywordTableService {
        KeywordTableService::new(store, Arc::new(InMemoryLocker::new()), &LocksConfig::default())
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let s1 = segment("ds", 1, &["rust", "tokio"]);
        store.insert_segment(&s1).await.unwrap();
        let svc = service(store.clone());

        svc.add("ds", &[s1.id.clone()]).await.unwrap();
        svc.add("ds", &[s1.id.clone()]).await.unwrap();

        let table = svc.get_or_create("ds").await.unwrap();
        assert_eq!(table.keyword_table["rust"], vec![s1.id.clone()]);
        assert_eq!(table.keyword_table["tokio"], vec![s1.id]);
    }

    #[tokio::test]
    async fn test_add_replaces_stale_keywords() {
        let store = Arc::new(InMemoryStore::new());
        let mut s1 = segment("ds", 1, &["old"]);
        store.insert_segment(&s1).await.unwrap();
        let svc = service(store.clone());
        svc.add("ds", &[s1.id.clone()]).await.unwrap();

        s1.keywords = vec!["new".to_string()];
        store.update_segment(&s1).await.unwrap();
        svc.add("ds", &[s1.id.clone()]).await.unwrap();

        let table = svc.get_or_create("ds").await.unwrap();
        assert!(!table.keyword_table.contains_key("old"));
        assert_eq!(table.keyword_table["new"], vec![s1.id]);
    }

    #[tokio::test]
    async fn test_remove_drops_ids_and_empty_keys() {
        let store = Arc::new(InMemoryStore::new());
        let s1 = segment("ds", 1, &["rust", "sqlite"]);
        let s2 = segment("ds", 2, &["rust"]);
        store.insert_segment(&s1).await.unwrap();
        store.insert_segment(&s2).await.unwrap();
        let svc = service(store.clone());
        svc.add("ds", &[s1.id.clone(), s2.id.clone()]).await.unwrap();

        svc.remove("ds", &[s1.id.clone()]).await.unwrap();

        let table = svc.get_or_create("ds").await.unwrap();
        assert_eq!(table.keyword_table["rust"], vec![s2.id]);
        assert!(!table.keyword_table.contains_key("sqlite"));
    }

    #[tokio::test]
    async fn test_get_or_create_persists_empty_row() {
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store.clone());
        let table = svc.get_or_create("ds").await.unwrap();
        assert!(table.keyword_table.is_empty());
        assert!(store.get_keyword_table("ds").await.unwrap().is_some());
    }
}
