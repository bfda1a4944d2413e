//! Retrieval strategies and the hybrid merge.
//!
//! Every retriever returns [`VectorDocument`]s whose metadata carries at
//! least `segment_id`, `document_id`, `dataset_id`, `score` and
//! `retrieval_method`.
//!
//! # Hybrid merge
//!
//! 1. Key both result lists by `segment_id`.
//! 2. Full-text only → `full_text`, with no `score`; semantic only →
//!    `semantic`; both → `hybrid`, keeping the semantic score.
//! 3. Sort documents carrying a semantic score by score descending,
//!    then `segment_id` ascending.
//! 4. Append full-text-only documents in full-text order.
//! 5. Truncate to `k`.
//!
//! The result depends only on the two lists, never on which finished first.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::vector::VectorDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    FullText,
    #[default]
    Semantic,
    Hybrid,
}

impl RetrievalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::FullText => "full_text",
            RetrievalStrategy::Semantic => "semantic",
            RetrievalStrategy::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full_text" => Some(RetrievalStrategy::FullText),
            "semantic" => Some(RetrievalStrategy::Semantic),
            "hybrid" => Some(RetrievalStrategy::Hybrid),
            _ => None,
        }
    }
}

pub const META_SEGMENT_ID: &str = "segment_id";
pub const META_DOCUMENT_ID: &str = "document_id";
pub const META_DATASET_ID: &str = "dataset_id";
pub const META_SCORE: &str = "score";
pub const META_RETRIEVAL_METHOD: &str = "retrieval_method";

/// Tag a document with the strategy that produced it.
pub fn mark_method(mut doc: VectorDocument, strategy: RetrievalStrategy) -> VectorDocument {
    doc.metadata.insert(
        META_RETRIEVAL_METHOD.to_string(),
        Value::from(strategy.as_str()),
    );
    doc
}

struct Merged {
    doc: VectorDocument,
    semantic_score: Option<f64>,
    full_text_rank: Option<usize>,
}

/// Merge full-text and semantic results by `segment_id`.
pub fn hybrid_merge(
    full_text: Vec<VectorDocument>,
    semantic: Vec<VectorDocument>,
    k: usize,
) -> Vec<VectorDocument> {
    let mut by_segment: HashMap<String, Merged> = HashMap::new();

    for (rank, doc) in full_text.into_iter().enumerate() {
        let Some(id) = doc.meta_str(META_SEGMENT_ID).map(str::to_string) else {
            continue;
        };
        let mut doc = mark_method(doc, RetrievalStrategy::FullText);
        doc.metadata.remove(META_SCORE);
        by_segment.entry(id).or_insert(Merged {
            doc,
            semantic_score: None,
            full_text_rank: Some(rank),
        });
    }

    for doc in semantic {
        let Some(id) = doc.meta_str(META_SEGMENT_ID).map(str::to_string) else {
            continue;
        };
        let score = doc.score().unwrap_or(0.0);
        match by_segment.get_mut(&id) {
            Some(existing) if existing.semantic_score.is_none() => {
                let mut merged = mark_method(doc, RetrievalStrategy::Hybrid);
                merged
                    .metadata
                    .insert(META_SCORE.to_string(), Value::from(score));
                existing.doc = merged;
                existing.semantic_score = Some(score);
            }
            Some(_) => {}
            None => {
                by_segment.insert(
                    id,
                    Merged {
                        doc: mark_method(doc, RetrievalStrategy::Semantic),
                        semantic_score: Some(score),
                        full_text_rank: None,
                    },
                );
            }
        }
    }

    let mut merged: Vec<(String, Merged)> = by_segment.into_iter().collect();
    merged.sort_by(|(a_id, a), (b_id, b)| match (a.semantic_score, b.semantic_score) {
        (Some(x), Some(y)) => y
            .partial_cmp(&x)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a_id.cmp(b_id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a
            .full_text_rank
            .cmp(&b.full_text_rank)
            .then_with(|| a_id.cmp(b_id)),
    });
    merged.truncate(k);
    merged.into_iter().map(|(_, m)| m.doc).collect()
}
