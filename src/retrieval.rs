//! Dataset retrieval: full-text, semantic and hybrid.
//!
//! | Strategy | Source | Order |
//! |----------|--------|-------|
//! | `full_text` | keyword tables | posting frequency desc, then first occurrence |
//! | `semantic` | vector store, filtered to enabled points | similarity desc |
//! | `hybrid` | both, run concurrently | see [`hybrid_merge`] |
//!
//! Every search logs one query row per dataset that appears in the results
//! and bumps the hit count of each returned segment. That bookkeeping runs
//! on a [`TaskTracker`] after the reply is built; [`RetrievalService::flush`]
//! waits for it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use llmops_core::keyword::extract_keywords;
use llmops_core::models::{new_id, now_ts, DatasetQuery, QuerySource, Segment, SegmentStatus};
use llmops_core::search::{
    hybrid_merge, mark_method, RetrievalStrategy, META_DATASET_ID, META_DOCUMENT_ID, META_SCORE,
    META_SEGMENT_ID,
};
use llmops_core::store::{DatasetStore, KeywordTableStore, SegmentStore, Store};
use llmops_core::vector::{Filter, VectorDocument, VectorStore};
use llmops_core::{Error, Result};

use crate::config::RetrievalConfig;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub account_id: String,
    pub dataset_ids: Vec<String>,
    pub query: String,
    pub strategy: RetrievalStrategy,
    pub k: usize,
    /// Minimum similarity for semantic hits; 0 disables the threshold.
    pub score: f64,
    pub source: QuerySource,
    pub source_app_id: Option<String>,
}

impl SearchRequest {
    pub fn new(account_id: &str, dataset_ids: Vec<String>, query: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            dataset_ids,
            query: query.to_string(),
            strategy: RetrievalStrategy::default(),
            k: 4,
            score: 0.0,
            source: QuerySource::HitTesting,
            source_app_id: None,
        }
    }

    pub fn strategy(mut self, strategy: RetrievalStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn source(mut self, source: QuerySource, app_id: Option<String>) -> Self {
        self.source = source;
        self.source_app_id = app_id;
        self
    }
}

pub struct RetrievalService {
    store: Arc<dyn Store>,
    vectors: Arc<dyn VectorStore>,
    settings: RetrievalConfig,
    tracker: TaskTracker,
}

impl RetrievalService {
    pub fn new(
        store: Arc<dyn Store>,
        vectors: Arc<dyn VectorStore>,
        settings: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            settings,
            tracker: TaskTracker::new(),
        }
    }

    pub fn settings(&self) -> &RetrievalConfig {
        &self.settings
    }

    /// The subset of `dataset_ids` owned by `account_id`, in request order.
    pub async fn validate_dataset_access(
        &self,
        account_id: &str,
        dataset_ids: &[String],
    ) -> Result<Vec<String>> {
        let owned = self
            .store
            .list_owned_datasets(account_id, dataset_ids)
            .await?;
        if owned.is_empty() {
            return Err(Error::Forbidden("no accessible dataset".to_string()));
        }
        Ok(owned.into_iter().map(|d| d.id).collect())
    }

    pub async fn search(&self, req: &SearchRequest) -> Result<Vec<VectorDocument>> {
        let query = req.query.trim();
        if query.is_empty() {
            return Err(Error::validation("query must not be empty"));
        }
        if req.k == 0 {
            return Err(Error::validation("k must be at least 1"));
        }
        let dataset_ids = self
            .validate_dataset_access(&req.account_id, &req.dataset_ids)
            .await?;

        let docs = match req.strategy {
            RetrievalStrategy::FullText => self.full_text(&dataset_ids, query, req.k).await?,
            RetrievalStrategy::Semantic => {
                self.semantic(&dataset_ids, query, req.k, req.score).await?
            }
            RetrievalStrategy::Hybrid => {
                let (full_text, semantic) = tokio::join!(
                    self.full_text(&dataset_ids, query, req.k),
                    self.semantic(&dataset_ids, query, req.k, req.score),
                );
                let full_text = full_text.unwrap_or_else(|e| {
                    warn!(error = %e, "full-text retrieval failed, continuing with semantic");
                    Vec::new()
                });
                let semantic = semantic.unwrap_or_else(|e| {
                    warn!(error = %e, "semantic retrieval failed, continuing with full-text");
                    Vec::new()
                });
                hybrid_merge(full_text, semantic, req.k)
            }
        };
        debug!(
            strategy = req.strategy.as_str(),
            hits = docs.len(),
            "retrieval finished"
        );

        self.spawn_bookkeeping(req, &docs);
        Ok(docs)
    }

    /// Keyword retrieval. Documents report a score of 0; their order is
    /// the only relevance signal.
    async fn full_text(
        &self,
        dataset_ids: &[String],
        query: &str,
        k: usize,
    ) -> Result<Vec<VectorDocument>> {
        let keywords = extract_keywords(query, self.settings.keyword_top_n);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.store.list_keyword_tables(dataset_ids).await?;

        // Concatenate postings; duplicates count as frequency.
        let mut hits: Vec<&String> = Vec::new();
        for keyword in &keywords {
            for dataset_id in dataset_ids {
                let postings = tables
                    .iter()
                    .find(|t| &t.dataset_id == dataset_id)
                    .and_then(|t| t.keyword_table.get(keyword));
                hits.extend(postings.into_iter().flatten());
            }
        }
        let ranked = rank_by_frequency(hits);
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let segments: HashMap<String, Segment> = self
            .store
            .list_segments_by_ids(&ranked, dataset_ids)
            .await?
            .into_iter()
            .filter(|s| s.enabled && s.status == SegmentStatus::Completed)
            .map(|s| (s.id.clone(), s))
            .collect();

        Ok(ranked
            .iter()
            .filter_map(|id| segments.get(id))
            .take(k)
            .map(|s| mark_method(segment_document(s), RetrievalStrategy::FullText))
            .collect())
    }

    async fn semantic(
        &self,
        dataset_ids: &[String],
        query: &str,
        k: usize,
        score: f64,
    ) -> Result<Vec<VectorDocument>> {
        let filter = Filter::new()
            .contains_any(META_DATASET_ID, dataset_ids.iter().cloned())
            .equal("document_enabled", true)
            .equal("segment_enabled", true);
        let docs = self
            .vectors
            .similarity_search(query, k, &filter, score)
            .await?;
        Ok(docs
            .into_iter()
            .map(|d| mark_method(d, RetrievalStrategy::Semantic))
            .collect())
    }

    // ============ Bookkeeping ============

    fn spawn_bookkeeping(&self, req: &SearchRequest, docs: &[VectorDocument]) {
        let mut dataset_ids: Vec<String> = Vec::new();
        let mut segment_ids: Vec<String> = Vec::new();
        for doc in docs {
            if let Some(id) = doc.meta_str(META_DATASET_ID) {
                if !dataset_ids.iter().any(|d| d == id) {
                    dataset_ids.push(id.to_string());
                }
            }
            if let Some(id) = doc.meta_str(META_SEGMENT_ID) {
                if !segment_ids.iter().any(|s| s == id) {
                    segment_ids.push(id.to_string());
                }
            }
        }
        if dataset_ids.is_empty() && segment_ids.is_empty() {
            return;
        }

        let store = self.store.clone();
        let req = req.clone();
        self.tracker.spawn(async move {
            for dataset_id in &dataset_ids {
                record_query(store.as_ref(), &req, dataset_id).await;
            }
            if let Err(e) = store.increment_hit_count(&segment_ids).await {
                warn!(error = %e, "failed to update segment hit counts");
            }
        });
    }

    /// Log one query row. Failures are logged, not returned.
    pub async fn record_dataset_query(&self, req: &SearchRequest, dataset_id: &str) {
        record_query(self.store.as_ref(), req, dataset_id).await;
    }

    /// `hit_count += 1` for each listed segment.
    pub async fn update_segment_hit_count(&self, segment_ids: &[String]) -> Result<()> {
        self.store.increment_hit_count(segment_ids).await?;
        Ok(())
    }

    /// Wait for every bookkeeping task spawned so far.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Recent queries against a dataset, newest first.
    pub async fn list_dataset_queries(
        &self,
        account_id: &str,
        dataset_id: &str,
        limit: usize,
    ) -> Result<Vec<DatasetQuery>> {
        let dataset = self
            .store
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("dataset {}", dataset_id)))?;
        if dataset.account_id != account_id {
            return Err(Error::Forbidden(format!(
                "dataset {} belongs to another account",
                dataset_id
            )));
        }
        Ok(self.store.list_dataset_queries(dataset_id, limit).await?)
    }
}

async fn record_query(store: &dyn Store, req: &SearchRequest, dataset_id: &str) {
    let row = DatasetQuery {
        id: new_id(),
        dataset_id: dataset_id.to_string(),
        query: req.query.clone(),
        source: req.source,
        source_app_id: req.source_app_id.clone(),
        created_by: req.account_id.clone(),
        created_at: now_ts(),
    };
    if let Err(e) = store.insert_dataset_query(&row).await {
        warn!(dataset_id, error = %e, "failed to record dataset query");
    }
}

/// Distinct IDs ordered by occurrence count, ties by first occurrence.
fn rank_by_frequency(hits: Vec<&String>) -> Vec<String> {
    let mut counts: HashMap<&String, (usize, usize)> = HashMap::new();
    for (i, id) in hits.iter().enumerate() {
        counts.entry(*id).or_insert((0, i)).0 += 1;
    }
    let mut seen = HashSet::new();
    let mut ranked: Vec<&String> = hits.into_iter().filter(|id| seen.insert(*id)).collect();
    ranked.sort_by(|a, b| {
        let (ca, fa) = counts[a];
        let (cb, fb) = counts[b];
        cb.cmp(&ca).then(fa.cmp(&fb))
    });
    ranked.into_iter().cloned().collect()
}

fn segment_document(segment: &Segment) -> VectorDocument {
    let mut metadata = Map::new();
    metadata.insert("account_id".into(), Value::from(segment.account_id.clone()));
    metadata.insert(META_DATASET_ID.into(), Value::from(segment.dataset_id.clone()));
    metadata.insert(META_DOCUMENT_ID.into(), Value::from(segment.document_id.clone()));
    metadata.insert(META_SEGMENT_ID.into(), Value::from(segment.id.clone()));
    metadata.insert("node_id".into(), Value::from(segment.node_id.clone()));
    metadata.insert(META_SCORE.into(), Value::from(0.0));
    VectorDocument {
        content: segment.content.clone(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_by_frequency_breaks_ties_by_first_occurrence() {
        let ids: Vec<String> = ["b", "a", "c", "a", "c", "d"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let ranked = rank_by_frequency(ids.iter().collect());
        assert_eq!(ranked, vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_rank_by_frequency_empty() {
        assert!(rank_by_frequency(Vec::new()).is_empty());
    }
}
