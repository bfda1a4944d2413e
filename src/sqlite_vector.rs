//! SQLite-backed vector store.
//!
//! Each point is one row of `vector_points`: the document text, its
//! metadata as JSON, and the embedding as a little-endian `f32` BLOB.
//! Search is brute-force cosine similarity over the rows whose metadata
//! matches the filter, which is adequate for the single-node deployments
//! this backend targets.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};

use llmops_core::embedding::{blob_to_vec, vec_to_blob, Embeddings};
use llmops_core::vector::{node_id_for, rank_candidates, Filter, VectorDocument, VectorStore};

pub struct SqliteVectorStore {
    pool: SqlitePool,
    embeddings: Arc<dyn Embeddings>,
}

struct StoredPoint {
    node_id: String,
    doc: VectorDocument,
    embedding: Vec<u8>,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool, embeddings: Arc<dyn Embeddings>) -> Self {
        Self { pool, embeddings }
    }

    /// Load every point whose metadata matches `filter`.
    ///
    /// Filters are evaluated in Rust against the decoded metadata so that
    /// `contains_any` over array fields behaves exactly like the in-memory
    /// store.
    async fn load_matching(&self, filter: &Filter, with_vectors: bool) -> Result<Vec<StoredPoint>> {
        let sql = if with_vectors {
            "SELECT node_id, content, metadata_json, embedding FROM vector_points"
        } else {
            "SELECT node_id, content, metadata_json, X'' AS embedding FROM vector_points"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let mut out = Vec::new();
        for row in rows {
            let meta_json: String = row.get("metadata_json");
            let metadata: Map<String, Value> = serde_json::from_str(&meta_json)?;
            if !filter.matches(&metadata) {
                continue;
            }
            out.push(StoredPoint {
                node_id: row.get("node_id"),
                doc: VectorDocument {
                    content: row.get("content"),
                    metadata,
                },
                embedding: row.get("embedding"),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn add_documents(&self, docs: Vec<VectorDocument>) -> Result<Vec<String>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = docs.iter().map(|d| d.content.clone()).collect();
        let vectors = self.embeddings.embed_documents(&texts).await?;
        if vectors.len() != docs.len() {
            bail!(
                "embedding provider returned {} vectors for {} documents",
                vectors.len(),
                docs.len()
            );
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(docs.len());
        for (mut doc, vector) in docs.into_iter().zip(vectors) {
            let id = node_id_for(&doc);
            doc.metadata
                .insert("node_id".to_string(), Value::from(id.clone()));
            sqlx::query(
                r#"
                INSERT INTO vector_points (node_id, content, metadata_json, embedding, dims, model)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(node_id) DO UPDATE SET
                    content = excluded.content,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding,
                    dims = excluded.dims,
                    model = excluded.model
                "#,
            )
            .bind(&id)
            .bind(&doc.content)
            .bind(Value::Object(doc.metadata).to_string())
            .bind(vec_to_blob(&vector))
            .bind(vector.len() as i64)
            .bind(self.embeddings.model_name())
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        filter: &Filter,
        score_threshold: f64,
    ) -> Result<Vec<VectorDocument>> {
        let query_vec = self.embeddings.embed_query(query).await?;
        let points = self.load_matching(filter, true).await?;
        let candidates = points
            .into_iter()
            .map(|p| (p.node_id, p.doc, blob_to_vec(&p.embedding)));
        Ok(rank_candidates(&query_vec, candidates, k, score_threshold))
    }

    async fn update_metadata(&self, filter: &Filter, set: Map<String, Value>) -> Result<usize> {
        let points = self.load_matching(filter, false).await?;
        let mut tx = self.pool.begin().await?;
        for p in &points {
            let mut metadata = p.doc.metadata.clone();
            for (k, v) in &set {
                metadata.insert(k.clone(), v.clone());
            }
            sqlx::query("UPDATE vector_points SET metadata_json = ? WHERE node_id = ?")
                .bind(Value::Object(metadata).to_string())
                .bind(&p.node_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(points.len())
    }

    async fn delete_by_filter(&self, filter: &Filter) -> Result<usize> {
        if filter.is_empty() {
            let res = sqlx::query("DELETE FROM vector_points")
                .execute(&self.pool)
                .await?;
            return Ok(res.rows_affected() as usize);
        }
        let points = self.load_matching(filter, false).await?;
        let mut tx = self.pool.begin().await?;
        for p in &points {
            sqlx::query("DELETE FROM vector_points WHERE node_id = ?")
                .bind(&p.node_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(points.len())
    }

    async fn count(&self, filter: &Filter) -> Result<usize> {
        Ok(self.load_matching(filter, false).await?.len())
    }
}
