//! Vector-store collaborator interface and an in-memory backend.
//!
//! Points carry free-form JSON metadata. Filters are conjunctions of
//! per-field conditions:
//!
//! ```json
//! { "dataset_id": { "contains_any": ["d1", "d2"] },
//!   "document_enabled": { "equal": true } }
//! ```
//!
//! A point's primary key is its `node_id` metadata field when present.
//! Adding a document whose `node_id` already exists replaces that point.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::embedding::{cosine_similarity, Embeddings};
use crate::models::new_id;

/// A retrievable document: content plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDocument {
    pub content: String,
    pub metadata: Map<String, Value>,
}

impl VectorDocument {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn score(&self) -> Option<f64> {
        self.metadata.get("score").and_then(Value::as_f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equal(Value),
    /// The field equals one of the values, or (for array fields) shares one.
    ContainsAny(Vec<Value>),
}

impl Condition {
    fn matches(&self, actual: Option<&Value>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        match self {
            Condition::Equal(v) => actual == v,
            Condition::ContainsAny(values) => match actual {
                Value::Array(items) => items.iter().any(|i| values.contains(i)),
                other => values.contains(other),
            },
        }
    }
}

/// Conjunction of field conditions. The empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equal(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push((field.to_string(), Condition::Equal(value.into())));
        self
    }

    pub fn contains_any<V: Into<Value>>(
        mut self,
        field: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.conditions
            .push((field.to_string(), Condition::ContainsAny(values)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        self.conditions
            .iter()
            .all(|(field, cond)| cond.matches(metadata.get(field)))
    }

    /// Wire form `{field: {equal: v}}` / `{field: {contains_any: [..]}}`.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (field, cond) in &self.conditions {
            let body = match cond {
                Condition::Equal(v) => serde_json::json!({ "equal": v }),
                Condition::ContainsAny(vs) => serde_json::json!({ "contains_any": vs }),
            };
            out.insert(field.clone(), body);
        }
        Value::Object(out)
    }
}

/// Vector store operations consumed by indexing and retrieval.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Embed and store documents. Returns one node ID per input, in order.
    async fn add_documents(&self, docs: Vec<VectorDocument>) -> anyhow::Result<Vec<String>>;

    /// Nearest neighbours of `query` among points matching `filter`.
    ///
    /// Each returned document carries its similarity in `metadata.score`.
    /// A `score_threshold` of 0 disables threshold filtering.
    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        filter: &Filter,
        score_threshold: f64,
    ) -> anyhow::Result<Vec<VectorDocument>>;

    /// Merge `set` into the metadata of every matching point.
    async fn update_metadata(&self, filter: &Filter, set: Map<String, Value>)
        -> anyhow::Result<usize>;

    async fn delete_by_filter(&self, filter: &Filter) -> anyhow::Result<usize>;

    async fn count(&self, filter: &Filter) -> anyhow::Result<usize>;
}

/// The node ID a document will be stored under.
pub fn node_id_for(doc: &VectorDocument) -> String {
    doc.meta_str("node_id")
        .map(str::to_string)
        .unwrap_or_else(new_id)
}

/// Score candidates against `query_vec`, apply the threshold, sort by
/// score descending (ties by node ID) and keep the top `k`.
pub fn rank_candidates<I>(
    query_vec: &[f32],
    candidates: I,
    k: usize,
    score_threshold: f64,
) -> Vec<VectorDocument>
where
    I: IntoIterator<Item = (String, VectorDocument, Vec<f32>)>,
{
    let mut scored: Vec<(f64, String, VectorDocument)> = candidates
        .into_iter()
        .map(|(id, doc, vec)| (cosine_similarity(query_vec, &vec) as f64, id, doc))
        .filter(|(score, _, _)| score_threshold <= 0.0 || *score >= score_threshold)
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    scored.truncate(k);
    scored
        .into_iter()
        .map(|(score, _, mut doc)| {
            doc.metadata.insert("score".to_string(), Value::from(score));
            doc
        })
        .collect()
}

struct Point {
    id: String,
    doc: VectorDocument,
    vector: Vec<f32>,
}

/// In-process vector store with brute-force cosine search.
pub struct InMemoryVectorStore {
    embeddings: Arc<dyn Embeddings>,
    points: RwLock<Vec<Point>>,
}

impl InMemoryVectorStore {
    pub fn new(embeddings: Arc<dyn Embeddings>) -> Self {
        Self {
            embeddings,
            points: RwLock::new(Vec::new()),
        }
    }

    fn poisoned() -> anyhow::Error {
        anyhow::anyhow!("vector store lock poisoned")
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add_documents(&self, docs: Vec<VectorDocument>) -> anyhow::Result<Vec<String>> {
        let texts: Vec<String> = docs.iter().map(|d| d.content.clone()).collect();
        let vectors = self.embeddings.embed_documents(&texts).await?;
        if vectors.len() != docs.len() {
            anyhow::bail!(
                "embedding provider returned {} vectors for {} documents",
                vectors.len(),
                docs.len()
            );
        }

        let mut points = self.points.write().map_err(|_| Self::poisoned())?;
        let mut ids = Vec::with_capacity(docs.len());
        for (mut doc, vector) in docs.into_iter().zip(vectors) {
            let id = node_id_for(&doc);
            doc.metadata
                .insert("node_id".to_string(), Value::from(id.clone()));
            points.retain(|p| p.id != id);
            points.push(Point {
                id: id.clone(),
                doc,
                vector,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        filter: &Filter,
        score_threshold: f64,
    ) -> anyhow::Result<Vec<VectorDocument>> {
        let query_vec = self.embeddings.embed_query(query).await?;
        let points = self.points.read().map_err(|_| Self::poisoned())?;
        let candidates = points
            .iter()
            .filter(|p| filter.matches(&p.doc.metadata))
            .map(|p| (p.id.clone(), p.doc.clone(), p.vector.clone()));
        Ok(rank_candidates(&query_vec, candidates, k, score_threshold))
    }

    async fn update_metadata(
        &self,
        filter: &Filter,
        set: Map<String, Value>,
    ) -> anyhow::Result<usize> {
        let mut points = self.points.write().map_err(|_| Self::poisoned())?;
        let mut n = 0;
        for p in points.iter_mut().filter(|p| filter.matches(&p.doc.metadata)) {
            for (k, v) in &set {
                p.doc.metadata.insert(k.clone(), v.clone());
            }
            n += 1;
        }
        Ok(n)
    }

    async fn delete_by_filter(&self, filter: &Filter) -> anyhow::Result<usize> {
        let mut points = self.points.write().map_err(|_| Self::poisoned())?;
        let before = points.len();
        points.retain(|p| !filter.matches(&p.doc.metadata));
        Ok(before - points.len())
    }

    async fn count(&self, filter: &Filter) -> anyhow::Result<usize> {
        let points = self.points.read().map_err(|_| Self::poisoned())?;
        Ok(points
            .iter()
            .filter(|p| filter.matches(&p.doc.metadata))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddings;
    use serde_json::json;

    fn doc(content: &str, dataset: &str, node: &str) -> VectorDocument {
        let metadata = json!({
            "dataset_id": dataset,
            "node_id": node,
            "document_enabled": true,
        });
        VectorDocument {
            content: content.to_string(),
            metadata: metadata.as_object().cloned().unwrap(),
        }
    }

    fn store() -> InMemoryVectorStore {
        InMemoryVectorStore::new(Arc::new(HashEmbeddings::new(1024)))
    }

    #[test]
    fn test_filter_semantics() {
        let meta = json!({"dataset_id": "d1", "tags": ["a", "b"], "enabled": true});
        let meta = meta.as_object().unwrap();
        assert!(Filter::new().matches(meta));
        assert!(Filter::new().equal("enabled", true).matches(meta));
        assert!(!Filter::new().equal("enabled", false).matches(meta));
        assert!(Filter::new().contains_any("dataset_id", ["d0", "d1"]).matches(meta));
        assert!(Filter::new().contains_any("tags", ["b"]).matches(meta));
        assert!(!Filter::new().equal("missing", 1).matches(meta));
    }

    #[test]
    fn test_filter_wire_form() {
        let f = Filter::new()
            .equal("document_enabled", true)
            .contains_any("dataset_id", ["d1"]);
        assert_eq!(
            f.to_json(),
            json!({
                "document_enabled": {"equal": true},
                "dataset_id": {"contains_any": ["d1"]}
            })
        );
    }

    #[tokio::test]
    async fn test_add_upserts_by_node_id() {
        let s = store();
        s.add_documents(vec![doc("first", "d1", "n1")]).await.unwrap();
        s.add_documents(vec![doc("second", "d1", "n1")]).await.unwrap();
        assert_eq!(s.count(&Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_filters_and_scores() {
        let s = store();
        s.add_documents(vec![
            doc("rust ownership borrowing", "d1", "n1"),
            doc("rust ownership", "d2", "n2"),
            doc("bread baking", "d1", "n3"),
        ])
        .await
        .unwrap();

        let filter = Filter::new().contains_any("dataset_id", ["d1"]);
        let hits = s
            .similarity_search("rust ownership", 10, &filter, 0.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].meta_str("node_id"), Some("n1"));
        assert!(hits[0].score().unwrap() > hits[1].score().unwrap());

        let strict = s
            .similarity_search("rust ownership", 10, &filter, 0.5)
            .await
            .unwrap();
        assert_eq!(strict.len(), 1);
    }

    #[tokio::test]
    async fn test_update_metadata_and_delete() {
        let s = store();
        s.add_documents(vec![doc("a", "d1", "n1"), doc("b", "d2", "n2")])
            .await
            .unwrap();
        let mut set = Map::new();
        set.insert("document_enabled".into(), Value::Bool(false));
        let n = s
            .update_metadata(&Filter::new().equal("node_id", "n1"), set)
            .await
            .unwrap();
        assert_eq!(n, 1);
        let enabled = Filter::new().equal("document_enabled", true);
        assert_eq!(s.count(&enabled).await.unwrap(), 1);

        let removed = s
            .delete_by_filter(&Filter::new().equal("dataset_id", "d2"))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(s.count(&Filter::new()).await.unwrap(), 1);
    }
}
