//! Document indexing pipeline.
//!
//! Turns uploaded files into retrievable segments:
//!
//! ```text
//! waiting → parsing → splitting → indexing → completed
//!              ↓          ↓           ↓
//!            error      error       error
//! ```
//!
//! | Stage | Work |
//! |-------|------|
//! | parse | download the blob to a temp file, extract text, clean it |
//! | split | apply pre-process rules, run the recursive splitter, upsert segments by position |
//! | index | extract keywords, add them to the dataset keyword table |
//! | complete | embed segments in batches; each batch marks its segments completed or error |
//!
//! Segments are keyed by `(document_id, position)`, so a rebuilt document
//! reuses its segment and node IDs instead of duplicating them. A failure
//! in any stage marks only that document as `error`; [`IndexingService::build_documents`]
//! never returns an error.
//!
//! The service also owns the enable toggle and the document and dataset
//! delete cascades.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use llmops_core::chunk::{content_hash, RecursiveSplitter};
use llmops_core::clean::{apply_pre_process_rules, clean_text};
use llmops_core::keyword::extract_keywords;
use llmops_core::llm::TokenCounter;
use llmops_core::lock::{document_enabled_lock_key, Locker};
use llmops_core::models::{
    new_id, now_ts, Dataset, Document, DocumentStatus, PreProcessRule, ProcessMode, ProcessRule,
    RuleSpec, Segment, SegmentRule, SegmentStatus, UploadFile, RULE_REMOVE_EXTRA_SPACE,
    RULE_REMOVE_URL_AND_EMAIL,
};
use llmops_core::object_store::{ObjectStore, PutOptions};
use llmops_core::search::{META_DATASET_ID, META_DOCUMENT_ID, META_SEGMENT_ID};
use llmops_core::store::{DatasetStore, DocumentStore, KeywordTableStore, SegmentStore, Store};
use llmops_core::vector::{Filter, VectorDocument, VectorStore};
use llmops_core::{Error, Result};

use crate::config::{IndexingConfig, LocksConfig};
use crate::extract::{is_supported, load_documents, mime_for_extension};
use crate::keyword_table::KeywordTableService;
use crate::lock::{acquire_with_retry, release_quietly};

/// How a new batch of documents should be split.
#[derive(Debug, Clone)]
pub enum ProcessRuleRequest {
    /// Platform defaults from `[indexing]`.
    Automatic,
    Custom(RuleSpec),
}

pub struct IndexingService {
    store: Arc<dyn Store>,
    vectors: Arc<dyn VectorStore>,
    objects: Arc<dyn ObjectStore>,
    locker: Arc<dyn Locker>,
    counter: Arc<dyn TokenCounter>,
    keyword_tables: Arc<KeywordTableService>,
    settings: IndexingConfig,
    enabled_lock_ttl: Duration,
    acquire_timeout: Duration,
}

impl IndexingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        vectors: Arc<dyn VectorStore>,
        objects: Arc<dyn ObjectStore>,
        locker: Arc<dyn Locker>,
        counter: Arc<dyn TokenCounter>,
        keyword_tables: Arc<KeywordTableService>,
        settings: IndexingConfig,
        locks: &LocksConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            objects,
            locker,
            counter,
            keyword_tables,
            settings,
            enabled_lock_ttl: Duration::from_secs(locks.document_enabled_ttl_secs),
            acquire_timeout: Duration::from_secs(locks.acquire_timeout_secs),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Datasets, files, documents
    // ═══════════════════════════════════════════════════════════════

    pub async fn create_dataset(
        &self,
        account_id: &str,
        name: &str,
        description: &str,
    ) -> Result<Dataset> {
        if name.trim().is_empty() {
            return Err(Error::validation("dataset name must not be empty"));
        }
        let mut dataset = Dataset::new(account_id, name.trim());
        dataset.description = description.to_string();
        self.store.insert_dataset(&dataset).await?;
        info!(dataset_id = %dataset.id, account_id, "dataset created");
        Ok(dataset)
    }

    /// A dataset owned by `account_id`.
    pub async fn owned_dataset(&self, account_id: &str, dataset_id: &str) -> Result<Dataset> {
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
        Ok(dataset)
    }

    /// A document owned by `account_id`.
    pub async fn get_document(&self, account_id: &str, document_id: &str) -> Result<Document> {
        let doc = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("document {}", document_id)))?;
        if doc.account_id != account_id {
            return Err(Error::Forbidden(format!(
                "document {} belongs to another account",
                document_id
            )));
        }
        Ok(doc)
    }

    /// Store a blob and record its upload row. The object key is
    /// `<account>/<yyyy>/<mm>/<dd>/<uuid>.<ext>`.
    pub async fn upload_file(
        &self,
        account_id: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadFile> {
        let extension = std::path::Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !is_supported(&extension) {
            return Err(Error::validation(format!(
                "unsupported file extension {:?}",
                extension
            )));
        }

        let id = new_id();
        let key = format!(
            "{}/{}/{}.{}",
            account_id,
            chrono::Utc::now().format("%Y/%m/%d"),
            id,
            extension
        );
        let mime_type = mime_for_extension(&extension).to_string();
        let hash = hex::encode(Sha256::digest(&bytes));
        let size = bytes.len() as i64;

        let opts = PutOptions {
            content_type: Some(mime_type.clone()),
        };
        self.objects.put(&key, bytes, &opts).await?;

        let file = UploadFile {
            id,
            account_id: account_id.to_string(),
            name: name.to_string(),
            key,
            size,
            extension,
            mime_type,
            hash,
            created_at: now_ts(),
        };
        self.store.insert_upload_file(&file).await?;
        debug!(upload_file_id = %file.id, size, "file uploaded");
        Ok(file)
    }

    /// Create one `waiting` document per uploaded file, sharing a process
    /// rule and a batch ID. Callers enqueue `document.build` afterwards.
    pub async fn create_documents(
        &self,
        account_id: &str,
        dataset_id: &str,
        upload_file_ids: &[String],
        rule: ProcessRuleRequest,
    ) -> Result<Vec<Document>> {
        if upload_file_ids.is_empty() {
            return Err(Error::validation("no upload files given"));
        }
        self.owned_dataset(account_id, dataset_id).await?;

        let (mode, spec) = match rule {
            ProcessRuleRequest::Automatic => (ProcessMode::Automatic, self.automatic_rule()),
            ProcessRuleRequest::Custom(spec) => (ProcessMode::Custom, spec),
        };
        // Reject bad split parameters before anything is persisted.
        RecursiveSplitter::new(
            spec.segment.chunk_size,
            spec.segment.chunk_overlap,
            &spec.segment.separators,
            self.counter.as_ref(),
        )?;

        let mut files = Vec::with_capacity(upload_file_ids.len());
        for id in upload_file_ids {
            let file = self
                .store
                .get_upload_file(id)
                .await?
                .ok_or_else(|| Error::not_found(format!("upload file {}", id)))?;
            if file.account_id != account_id {
                return Err(Error::Forbidden(format!(
                    "upload file {} belongs to another account",
                    id
                )));
            }
            files.push(file);
        }

        let process_rule = ProcessRule {
            id: new_id(),
            account_id: account_id.to_string(),
            dataset_id: dataset_id.to_string(),
            mode,
            rule: spec,
            created_at: now_ts(),
        };
        self.store.insert_process_rule(&process_rule).await?;

        let batch = format!(
            "{}{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            &new_id()[..8]
        );
        let mut position = self.store.max_document_position(dataset_id).await?;
        let mut documents = Vec::with_capacity(files.len());
        for file in files {
            position += 1;
            let mut doc =
                Document::new(account_id, dataset_id, &file.id, &process_rule.id, &file.name);
            doc.position = position;
            doc.batch = batch.clone();
            self.store.insert_document(&doc).await?;
            documents.push(doc);
        }
        info!(dataset_id, batch = %batch, count = documents.len(), "documents created");
        Ok(documents)
    }

    fn automatic_rule(&self) -> RuleSpec {
        RuleSpec {
            pre_process_rules: vec![
                PreProcessRule {
                    id: RULE_REMOVE_EXTRA_SPACE.to_string(),
                    enabled: true,
                },
                PreProcessRule {
                    id: RULE_REMOVE_URL_AND_EMAIL.to_string(),
                    enabled: false,
                },
            ],
            segment: SegmentRule {
                chunk_size: self.settings.default_chunk_size,
                chunk_overlap: self.settings.default_chunk_overlap,
                separators: self.settings.default_separators.clone(),
            },
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Build
    // ═══════════════════════════════════════════════════════════════

    /// Build every listed document. Failures are recorded on the document
    /// row and never returned.
    pub async fn build_documents(&self, document_ids: &[String]) {
        for id in document_ids {
            match self.build_document(id).await {
                Ok(segments) => info!(document_id = %id, segments, "document built"),
                Err(e) => {
                    warn!(document_id = %id, error = %e, "document build failed");
                    self.mark_document_error(id, &e).await;
                }
            }
        }
    }

    async fn mark_document_error(&self, document_id: &str, err: &Error) {
        let doc = match self.store.get_document(document_id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return,
            Err(e) => {
                warn!(document_id, error = %e, "cannot load document to record failure");
                return;
            }
        };
        let mut doc = doc;
        let now = now_ts();
        doc.status = DocumentStatus::Error;
        doc.error = err.to_string();
        doc.stopped_at = Some(now);
        doc.updated_at = now;
        if let Err(e) = self.store.update_document(&doc).await {
            warn!(document_id, error = %e, "cannot record document failure");
        }
    }

    /// Run every stage for one document. Returns the segment count.
    async fn build_document(&self, document_id: &str) -> Result<usize> {
        let mut doc = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("document {}", document_id)))?;

        let now = now_ts();
        doc.status = DocumentStatus::Parsing;
        doc.processing_started_at = Some(now);
        doc.error.clear();
        doc.stopped_at = None;
        doc.updated_at = now;
        self.store.update_document(&doc).await?;

        // ============ Parse ============
        let texts = self.parse(&doc).await?;
        let now = now_ts();
        doc.character_count = texts.iter().map(|t| t.chars().count() as i64).sum();
        doc.status = DocumentStatus::Splitting;
        doc.parsing_completed_at = Some(now);
        doc.updated_at = now;
        self.store.update_document(&doc).await?;

        // ============ Split ============
        let rule = self
            .store
            .get_process_rule(&doc.process_rule_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("process rule {}", doc.process_rule_id)))?;
        let chunks = self.split(&texts, &rule.rule)?;
        let mut segments = self.upsert_segments(&doc, chunks).await?;
        let now = now_ts();
        doc.token_count = segments.iter().map(|s| s.token_count).sum();
        doc.status = DocumentStatus::Indexing;
        doc.splitting_completed_at = Some(now);
        doc.updated_at = now;
        self.store.update_document(&doc).await?;

        // ============ Index ============
        for segment in segments.iter_mut() {
            let now = now_ts();
            segment.keywords = extract_keywords(&segment.content, self.settings.max_keywords);
            segment.status = SegmentStatus::Indexing;
            segment.indexing_completed_at = Some(now);
            segment.updated_at = now;
            self.store.update_segment(segment).await?;
        }
        let ids: Vec<String> = segments.iter().map(|s| s.id.clone()).collect();
        self.keyword_tables.add(&doc.dataset_id, &ids).await?;

        // ============ Complete ============
        self.embed_segments(&doc, &mut segments).await;

        let now = now_ts();
        doc.character_count = segments.iter().map(|s| s.character_count).sum();
        doc.token_count = segments.iter().map(|s| s.token_count).sum();
        doc.status = DocumentStatus::Completed;
        doc.enabled = true;
        doc.disabled_at = None;
        doc.indexing_completed_at = Some(now);
        doc.completed_at = Some(now);
        doc.updated_at = now;
        self.store.update_document(&doc).await?;
        Ok(segments.len())
    }

    async fn parse(&self, doc: &Document) -> Result<Vec<String>> {
        let file = self
            .store
            .get_upload_file(&doc.upload_file_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("upload file {}", doc.upload_file_id)))?;
        let bytes = self.objects.get(&file.key).await?;

        // Removed on drop, whichever way this function returns.
        let tmp = tempfile::Builder::new()
            .prefix("llmops-")
            .suffix(&format!(".{}", file.extension))
            .tempfile()
            .context("creating temp file")?;
        tokio::fs::write(tmp.path(), &bytes)
            .await
            .context("writing temp file")?;

        let path = tmp.path().to_path_buf();
        let extension = file.extension.clone();
        let texts = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
            let bytes = std::fs::read(&path)?;
            Ok(load_documents(&bytes, &extension)?)
        })
        .await
        .context("extraction task panicked")??;
        drop(tmp);

        Ok(texts.iter().map(|t| clean_text(t)).collect())
    }

    fn split(&self, texts: &[String], rule: &RuleSpec) -> Result<Vec<String>> {
        let splitter = RecursiveSplitter::new(
            rule.segment.chunk_size,
            rule.segment.chunk_overlap,
            &rule.segment.separators,
            self.counter.as_ref(),
        )?;
        let mut chunks = Vec::new();
        for text in texts {
            let text = apply_pre_process_rules(text, rule);
            chunks.extend(
                splitter
                    .split_text(&text)
                    .into_iter()
                    .filter(|c| !c.trim().is_empty()),
            );
        }
        Ok(chunks)
    }

    /// Write one `waiting` segment per chunk at positions `1..=n`, reusing
    /// the IDs of segments already at those positions. Segments beyond `n`
    /// from an earlier build are removed with their vectors and postings.
    async fn upsert_segments(&self, doc: &Document, chunks: Vec<String>) -> Result<Vec<Segment>> {
        let now = now_ts();
        let mut segments = Vec::with_capacity(chunks.len());
        for (i, content) in chunks.into_iter().enumerate() {
            let position = i as i64 + 1;
            let character_count = content.chars().count() as i64;
            let token_count = self.counter.count_tokens(&content) as i64;
            let hash = content_hash(&content);

            match self.store.get_segment_by_position(&doc.id, position).await? {
                Some(mut existing) => {
                    existing.content = content;
                    existing.character_count = character_count;
                    existing.token_count = token_count;
                    existing.hash = hash;
                    existing.keywords.clear();
                    existing.enabled = false;
                    existing.status = SegmentStatus::Waiting;
                    existing.processing_started_at = Some(now);
                    existing.indexing_completed_at = None;
                    existing.completed_at = None;
                    existing.stopped_at = None;
                    existing.error.clear();
                    existing.updated_at = now;
                    self.store.update_segment(&existing).await?;
                    segments.push(existing);
                }
                None => {
                    let segment = Segment {
                        id: new_id(),
                        account_id: doc.account_id.clone(),
                        dataset_id: doc.dataset_id.clone(),
                        document_id: doc.id.clone(),
                        position,
                        content,
                        character_count,
                        token_count,
                        keywords: Vec::new(),
                        hash,
                        node_id: new_id(),
                        hit_count: 0,
                        enabled: false,
                        disabled_at: None,
                        processing_started_at: Some(now),
                        indexing_completed_at: None,
                        completed_at: None,
                        stopped_at: None,
                        error: String::new(),
                        status: SegmentStatus::Waiting,
                        created_at: now,
                        updated_at: now,
                    };
                    self.store.insert_segment(&segment).await?;
                    segments.push(segment);
                }
            }
        }

        let stale: Vec<Segment> = self
            .store
            .list_segments_by_document(&doc.id)
            .await?
            .into_iter()
            .filter(|s| s.position > segments.len() as i64)
            .collect();
        if !stale.is_empty() {
            let stale_ids: Vec<String> = stale.iter().map(|s| s.id.clone()).collect();
            for segment in &stale {
                let filter = Filter::new().equal("node_id", segment.node_id.clone());
                if let Err(e) = self.vectors.delete_by_filter(&filter).await {
                    warn!(segment_id = %segment.id, error = %e, "failed to delete stale vector");
                }
            }
            self.keyword_tables
                .remove(&doc.dataset_id, &stale_ids)
                .await?;
            self.store.delete_segments_by_ids(&stale_ids).await?;
            debug!(document_id = %doc.id, removed = stale_ids.len(), "stale segments removed");
        }
        Ok(segments)
    }

    /// Embed segments in batches. A failed batch marks its own segments as
    /// `error` and leaves the rest alone.
    async fn embed_segments(&self, doc: &Document, segments: &mut [Segment]) {
        let batch_size = self.settings.vector_batch_size.max(1);
        for batch in segments.chunks_mut(batch_size) {
            let docs: Vec<VectorDocument> = batch
                .iter()
                .map(|s| VectorDocument {
                    content: s.content.clone(),
                    metadata: segment_metadata(s),
                })
                .collect();

            let outcome = self.vectors.add_documents(docs).await;
            let now = now_ts();
            for segment in batch.iter_mut() {
                match &outcome {
                    Ok(_) => {
                        segment.status = SegmentStatus::Completed;
                        segment.enabled = true;
                        segment.disabled_at = None;
                        segment.completed_at = Some(now);
                    }
                    Err(e) => {
                        segment.status = SegmentStatus::Error;
                        segment.enabled = false;
                        segment.error = e.to_string();
                        segment.stopped_at = Some(now);
                    }
                }
                segment.updated_at = now;
                if let Err(e) = self.store.update_segment(segment).await {
                    warn!(segment_id = %segment.id, error = %e, "failed to record segment state");
                }
            }
            if let Err(e) = outcome {
                warn!(document_id = %doc.id, batch = batch.len(), error = %e, "vector batch failed");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Enable toggle
    // ═══════════════════════════════════════════════════════════════

    /// Flip a completed document's `enabled` flag. Callers then enqueue
    /// `document.update_enabled` to propagate it with
    /// [`sync_document_enabled`](Self::sync_document_enabled).
    pub async fn set_document_enabled(
        &self,
        account_id: &str,
        document_id: &str,
        enabled: bool,
    ) -> Result<Document> {
        let mut doc = self.get_document(account_id, document_id).await?;
        if doc.status != DocumentStatus::Completed {
            return Err(Error::validation(format!(
                "document {} is {}, only completed documents can be toggled",
                document_id, doc.status
            )));
        }
        if doc.enabled == enabled {
            return Ok(doc);
        }

        let now = now_ts();
        doc.enabled = enabled;
        doc.disabled_at = if enabled { None } else { Some(now) };
        doc.updated_at = now;
        self.store.update_document(&doc).await?;
        Ok(doc)
    }

    /// Propagate the document's current `enabled` flag to its vector points
    /// and the keyword table, under the per-document lock.
    ///
    /// Waits for a toggle already in flight, then reads the flag, so the
    /// last sync always applies the latest value.
    pub async fn sync_document_enabled(&self, document_id: &str) -> Result<()> {
        let key = document_enabled_lock_key(document_id);
        let token = acquire_with_retry(
            self.locker.as_ref(),
            &key,
            self.enabled_lock_ttl,
            self.acquire_timeout,
        )
        .await?;

        let result = async {
            let doc = self
                .store
                .get_document(document_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("document {}", document_id)))?;
            self.apply_enabled(&doc).await?;
            Ok::<bool, Error>(doc.enabled)
        }
        .await;
        release_quietly(self.locker.as_ref(), &key, &token).await;

        let enabled = result?;
        info!(document_id, enabled, "document enabled state synced");
        Ok(())
    }

    async fn apply_enabled(&self, doc: &Document) -> Result<()> {
        let segments = self.store.list_segments_by_document(&doc.id).await?;
        let mut synced = Vec::new();

        for segment in segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Completed)
        {
            let filter = Filter::new().equal("node_id", segment.node_id.clone());
            let mut set = Map::new();
            set.insert("document_enabled".to_string(), Value::Bool(doc.enabled));
            match self.vectors.update_metadata(&filter, set).await {
                Ok(_) => {
                    if segment.enabled {
                        synced.push(segment.id.clone());
                    }
                }
                Err(e) => {
                    warn!(segment_id = %segment.id, error = %e, "failed to update vector metadata");
                    let mut failed = segment.clone();
                    let now = now_ts();
                    failed.status = SegmentStatus::Error;
                    failed.error = e.to_string();
                    failed.stopped_at = Some(now);
                    failed.updated_at = now;
                    if let Err(e) = self.store.update_segment(&failed).await {
                        warn!(segment_id = %segment.id, error = %e, "failed to record segment state");
                    }
                }
            }
        }

        if doc.enabled {
            self.keyword_tables.add(&doc.dataset_id, &synced).await
        } else {
            let all: Vec<String> = segments.iter().map(|s| s.id.clone()).collect();
            self.keyword_tables.remove(&doc.dataset_id, &all).await
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Delete cascades
    // ═══════════════════════════════════════════════════════════════

    /// Remove a document with its vectors, segments and keyword postings.
    /// Each step is attempted even when an earlier one fails.
    pub async fn delete_document(&self, dataset_id: &str, document_id: &str) -> Result<()> {
        let filter = Filter::new().equal(META_DOCUMENT_ID, document_id);
        if let Err(e) = self.vectors.delete_by_filter(&filter).await {
            warn!(document_id, error = %e, "failed to delete document vectors");
        }

        let segment_ids: Vec<String> = self
            .store
            .list_segments_by_document(document_id)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        if let Err(e) = self.store.delete_segments_by_document(document_id).await {
            warn!(document_id, error = %e, "failed to delete segments");
        }
        if let Err(e) = self.keyword_tables.remove(dataset_id, &segment_ids).await {
            warn!(document_id, error = %e, "failed to remove keyword postings");
        }
        if let Err(e) = self.store.delete_document(document_id).await {
            warn!(document_id, error = %e, "failed to delete document row");
        }
        info!(dataset_id, document_id, segments = segment_ids.len(), "document deleted");
        Ok(())
    }

    /// Remove a dataset and everything derived from it.
    pub async fn delete_dataset(&self, dataset_id: &str) -> Result<()> {
        let documents = self.store.delete_documents_by_dataset(dataset_id).await?;
        let segments = self.store.delete_segments_by_dataset(dataset_id).await?;
        self.store.delete_keyword_table(dataset_id).await?;
        self.store.delete_dataset_queries(dataset_id).await?;
        self.store.delete_dataset(dataset_id).await?;

        let filter = Filter::new().equal(META_DATASET_ID, dataset_id);
        if let Err(e) = self.vectors.delete_by_filter(&filter).await {
            warn!(dataset_id, error = %e, "failed to delete dataset vectors");
        }
        info!(dataset_id, documents, segments, "dataset deleted");
        Ok(())
    }
}

fn segment_metadata(segment: &Segment) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("account_id".into(), Value::from(segment.account_id.clone()));
    meta.insert(META_DATASET_ID.into(), Value::from(segment.dataset_id.clone()));
    meta.insert(META_DOCUMENT_ID.into(), Value::from(segment.document_id.clone()));
    meta.insert(META_SEGMENT_ID.into(), Value::from(segment.id.clone()));
    meta.insert("node_id".into(), Value::from(segment.node_id.clone()));
    meta.insert("document_enabled".into(), Value::Bool(true));
    meta.insert("segment_enabled".into(), Value::Bool(true));
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmops_core::embedding::HashEmbeddings;
    use llmops_core::llm::ApproxTokenCounter;
    use llmops_core::lock::InMemoryLocker;
    use llmops_core::object_store::InMemoryObjectStore;
    use llmops_core::store::memory::InMemoryStore;
    use llmops_core::vector::InMemoryVectorStore;
    use llmops_core::ErrorKind;

    fn service() -> (IndexingService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let locker: Arc<dyn Locker> = Arc::new(InMemoryLocker::new());
        let locks = LocksConfig::default();
        let keyword_tables = Arc::new(KeywordTableService::new(
            store.clone(),
            locker.clone(),
            &locks,
        ));
        let svc = IndexingService::new(
            store.clone(),
            Arc::new(InMemoryVectorStore::new(Arc::new(HashEmbeddings::new(64)))),
            Arc::new(InMemoryObjectStore::new()),
            locker,
            Arc::new(ApproxTokenCounter),
            keyword_tables,
            IndexingConfig::default(),
            &locks,
        );
        (svc, store)
    }

    #[tokio::test]
    async fn test_upload_rejects_unknown_extension() {
        let (svc, _) = service();
        let err = svc
            .upload_file("acct", "a.exe", b"MZ".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_create_documents_assigns_positions_and_batch() {
        let (svc, _) = service();
        let ds = svc.create_dataset("acct", "docs", "").await.unwrap();
        let a = svc.upload_file("acct", "a.txt", b"alpha".to_vec()).await.unwrap();
        let b = svc.upload_file("acct", "b.md", b"beta".to_vec()).await.unwrap();

        let docs = svc
            .create_documents("acct", &ds.id, &[a.id, b.id], ProcessRuleRequest::Automatic)
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].position, 1);
        assert_eq!(docs[1].position, 2);
        assert_eq!(docs[0].batch, docs[1].batch);
        assert_eq!(docs[0].status, DocumentStatus::Waiting);
    }

    #[tokio::test]
    async fn test_create_documents_checks_dataset_owner() {
        let (svc, _) = service();
        let ds = svc.create_dataset("owner", "docs", "").await.unwrap();
        let file = svc.upload_file("intruder", "a.txt", b"x".to_vec()).await.unwrap();
        let err = svc
            .create_documents("intruder", &ds.id, &[file.id], ProcessRuleRequest::Automatic)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_custom_rule_with_bad_overlap_is_rejected() {
        let (svc, _) = service();
        let ds = svc.create_dataset("acct", "docs", "").await.unwrap();
        let file = svc.upload_file("acct", "a.txt", b"x".to_vec()).await.unwrap();
        let rule = RuleSpec {
            pre_process_rules: Vec::new(),
            segment: SegmentRule {
                chunk_size: 10,
                chunk_overlap: 10,
                separators: vec!["\n".into()],
            },
        };
        let err = svc
            .create_documents("acct", &ds.id, &[file.id], ProcessRuleRequest::Custom(rule))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_build_missing_blob_marks_document_error() {
        let (svc, store) = service();
        let ds = svc.create_dataset("acct", "docs", "").await.unwrap();
        let file = svc.upload_file("acct", "a.txt", b"hello".to_vec()).await.unwrap();
        let docs = svc
            .create_documents("acct", &ds.id, &[file.id.clone()], ProcessRuleRequest::Automatic)
            .await
            .unwrap();
        svc.objects.delete(&file.key).await.unwrap();

        svc.build_documents(&[docs[0].id.clone()]).await;

        let doc = store.get_document(&docs[0].id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Error);
        assert!(doc.stopped_at.is_some());
        assert!(!doc.error.is_empty());
    }

    #[tokio::test]
    async fn test_toggle_requires_completed_document() {
        let (svc, _) = service();
        let ds = svc.create_dataset("acct", "docs", "").await.unwrap();
        let file = svc.upload_file("acct", "a.txt", b"hello".to_vec()).await.unwrap();
        let docs = svc
            .create_documents("acct", &ds.id, &[file.id], ProcessRuleRequest::Automatic)
            .await
            .unwrap();
        let err = svc
            .set_document_enabled("acct", &docs[0].id, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_segment_metadata_fields() {
        let meta = segment_metadata(&Segment {
            id: "s".into(),
            account_id: "a".into(),
            dataset_id: "d".into(),
            document_id: "doc".into(),
            position: 1,
            content: String::new(),
            character_count: 0,
            token_count: 0,
            keywords: Vec::new(),
            hash: String::new(),
            node_id: "n".into(),
            hit_count: 0,
            enabled: false,
            disabled_at: None,
            processing_started_at: None,
            indexing_completed_at: None,
            completed_at: None,
            stopped_at: None,
            error: String::new(),
            status: SegmentStatus::Waiting,
            created_at: 0,
            updated_at: 0,
        });
        assert_eq!(meta["segment_id"], "s");
        assert_eq!(meta["node_id"], "n");
        assert_eq!(meta["document_enabled"], true);
        assert_eq!(meta["segment_enabled"], true);
    }
}
