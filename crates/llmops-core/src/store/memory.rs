//! In-memory [`Store`](super::Store) implementation for tests.
//!
//! All tables live in one struct behind a `std::sync::RwLock`, so every
//! method is a single critical section.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{
    App, Dataset, DatasetQuery, Document, KeywordTable, ProcessRule, Segment, UploadFile,
    Workflow, WorkflowResult,
};

use super::{AppStore, DatasetStore, DocumentStore, KeywordTableStore, SegmentStore, WorkflowStore};

#[derive(Default)]
struct Tables {
    upload_files: HashMap<String, UploadFile>,
    datasets: HashMap<String, Dataset>,
    dataset_queries: Vec<DatasetQuery>,
    process_rules: HashMap<String, ProcessRule>,
    documents: HashMap<String, Document>,
    segments: HashMap<String, Segment>,
    keyword_tables: HashMap<String, KeywordTable>,
    workflows: HashMap<String, Workflow>,
    workflow_results: Vec<WorkflowResult>,
    apps: HashMap<String, App>,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| anyhow!("store lock poisoned"))
    }
}

#[async_trait]
impl DatasetStore for InMemoryStore {
    async fn insert_dataset(&self, dataset: &Dataset) -> Result<()> {
        self.write()?
            .datasets
            .insert(dataset.id.clone(), dataset.clone());
        Ok(())
    }

    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        Ok(self.read()?.datasets.get(id).cloned())
    }

    async fn list_owned_datasets(&self, account_id: &str, ids: &[String]) -> Result<Vec<Dataset>> {
        let t = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| t.datasets.get(id))
            .filter(|d| d.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn delete_dataset(&self, id: &str) -> Result<()> {
        self.write()?.datasets.remove(id);
        Ok(())
    }

    async fn insert_dataset_query(&self, query: &DatasetQuery) -> Result<()> {
        self.write()?.dataset_queries.push(query.clone());
        Ok(())
    }

    async fn list_dataset_queries(
        &self,
        dataset_id: &str,
        limit: usize,
    ) -> Result<Vec<DatasetQuery>> {
        let t = self.read()?;
        Ok(t.dataset_queries
            .iter()
            .rev()
            .filter(|q| q.dataset_id == dataset_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_dataset_queries(&self, dataset_id: &str) -> Result<u64> {
        let mut t = self.write()?;
        let before = t.dataset_queries.len();
        t.dataset_queries.retain(|q| q.dataset_id != dataset_id);
        Ok((before - t.dataset_queries.len()) as u64)
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn insert_upload_file(&self, file: &UploadFile) -> Result<()> {
        self.write()?
            .upload_files
            .insert(file.id.clone(), file.clone());
        Ok(())
    }

    async fn get_upload_file(&self, id: &str) -> Result<Option<UploadFile>> {
        Ok(self.read()?.upload_files.get(id).cloned())
    }

    async fn insert_process_rule(&self, rule: &ProcessRule) -> Result<()> {
        self.write()?
            .process_rules
            .insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn get_process_rule(&self, id: &str) -> Result<Option<ProcessRule>> {
        Ok(self.read()?.process_rules.get(id).cloned())
    }

    async fn insert_document(&self, doc: &Document) -> Result<()> {
        self.write()?.documents.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        let mut t = self.write()?;
        match t.documents.get_mut(&doc.id) {
            Some(row) => {
                *row = doc.clone();
                Ok(())
            }
            None => Err(anyhow!("document {} does not exist", doc.id)),
        }
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.documents.get(id).cloned())
    }

    async fn list_documents(&self, dataset_id: &str) -> Result<Vec<Document>> {
        let t = self.read()?;
        let mut docs: Vec<Document> = t
            .documents
            .values()
            .filter(|d| d.dataset_id == dataset_id)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.position);
        Ok(docs)
    }

    async fn max_document_position(&self, dataset_id: &str) -> Result<i64> {
        let t = self.read()?;
        Ok(t.documents
            .values()
            .filter(|d| d.dataset_id == dataset_id)
            .map(|d| d.position)
            .max()
            .unwrap_or(0))
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        self.write()?.documents.remove(id);
        Ok(())
    }

    async fn delete_documents_by_dataset(&self, dataset_id: &str) -> Result<u64> {
        let mut t = self.write()?;
        let before = t.documents.len();
        t.documents.retain(|_, d| d.dataset_id != dataset_id);
        Ok((before - t.documents.len()) as u64)
    }
}

#[async_trait]
impl SegmentStore for InMemoryStore {
    async fn insert_segment(&self, segment: &Segment) -> Result<()> {
        let mut t = self.write()?;
        let clash = t.segments.values().any(|s| {
            s.document_id == segment.document_id && s.position == segment.position
        });
        if clash {
            return Err(anyhow!(
                "segment position {} already used in document {}",
                segment.position,
                segment.document_id
            ));
        }
        t.segments.insert(segment.id.clone(), segment.clone());
        Ok(())
    }

    async fn update_segment(&self, segment: &Segment) -> Result<()> {
        let mut t = self.write()?;
        match t.segments.get_mut(&segment.id) {
            Some(row) => {
                *row = segment.clone();
                Ok(())
            }
            None => Err(anyhow!("segment {} does not exist", segment.id)),
        }
    }

    async fn get_segment(&self, id: &str) -> Result<Option<Segment>> {
        Ok(self.read()?.segments.get(id).cloned())
    }

    async fn get_segment_by_position(
        &self,
        document_id: &str,
        position: i64,
    ) -> Result<Option<Segment>> {
        let t = self.read()?;
        Ok(t.segments
            .values()
            .find(|s| s.document_id == document_id && s.position == position)
            .cloned())
    }

    async fn max_segment_position(&self, document_id: &str) -> Result<i64> {
        let t = self.read()?;
        Ok(t.segments
            .values()
            .filter(|s| s.document_id == document_id)
            .map(|s| s.position)
            .max()
            .unwrap_or(0))
    }

    async fn list_segments_by_document(&self, document_id: &str) -> Result<Vec<Segment>> {
        let t = self.read()?;
        let mut segs: Vec<Segment> = t
            .segments
            .values()
            .filter(|s| s.document_id == document_id)
            .cloned()
            .collect();
        segs.sort_by_key(|s| s.position);
        Ok(segs)
    }

    async fn list_segments_by_ids(
        &self,
        ids: &[String],
        dataset_ids: &[String],
    ) -> Result<Vec<Segment>> {
        let t = self.read()?;
        let mut seen = std::collections::HashSet::new();
        Ok(ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| t.segments.get(id))
            .filter(|s| dataset_ids.contains(&s.dataset_id))
            .cloned()
            .collect())
    }

    async fn increment_hit_count(&self, ids: &[String]) -> Result<()> {
        let mut t = self.write()?;
        for id in ids {
            if let Some(s) = t.segments.get_mut(id) {
                s.hit_count += 1;
            }
        }
        Ok(())
    }

    async fn delete_segments_by_ids(&self, ids: &[String]) -> Result<u64> {
        let mut t = self.write()?;
        let before = t.segments.len();
        t.segments.retain(|id, _| !ids.contains(id));
        Ok((before - t.segments.len()) as u64)
    }

    async fn delete_segments_by_document(&self, document_id: &str) -> Result<u64> {
        let mut t = self.write()?;
        let before = t.segments.len();
        t.segments.retain(|_, s| s.document_id != document_id);
        Ok((before - t.segments.len()) as u64)
    }

    async fn delete_segments_by_dataset(&self, dataset_id: &str) -> Result<u64> {
        let mut t = self.write()?;
        let before = t.segments.len();
        t.segments.retain(|_, s| s.dataset_id != dataset_id);
        Ok((before - t.segments.len()) as u64)
    }
}

#[async_trait]
impl KeywordTableStore for InMemoryStore {
    async fn get_keyword_table(&self, dataset_id: &str) -> Result<Option<KeywordTable>> {
        Ok(self.read()?.keyword_tables.get(dataset_id).cloned())
    }

    async fn save_keyword_table(&self, table: &KeywordTable) -> Result<()> {
        self.write()?
            .keyword_tables
            .insert(table.dataset_id.clone(), table.clone());
        Ok(())
    }

    async fn list_keyword_tables(&self, dataset_ids: &[String]) -> Result<Vec<KeywordTable>> {
        let t = self.read()?;
        Ok(dataset_ids
            .iter()
            .filter_map(|id| t.keyword_tables.get(id))
            .cloned()
            .collect())
    }

    async fn delete_keyword_table(&self, dataset_id: &str) -> Result<()> {
        self.write()?.keyword_tables.remove(dataset_id);
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.write()?
            .workflows
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut t = self.write()?;
        match t.workflows.get_mut(&workflow.id) {
            Some(row) => {
                *row = workflow.clone();
                Ok(())
            }
            None => Err(anyhow!("workflow {} does not exist", workflow.id)),
        }
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(self.read()?.workflows.get(id).cloned())
    }

    async fn find_workflow_by_tool_call_name(
        &self,
        account_id: &str,
        tool_call_name: &str,
    ) -> Result<Option<Workflow>> {
        let t = self.read()?;
        Ok(t.workflows
            .values()
            .find(|w| w.account_id == account_id && w.tool_call_name == tool_call_name)
            .cloned())
    }

    async fn list_workflows(&self, account_id: &str) -> Result<Vec<Workflow>> {
        let t = self.read()?;
        let mut out: Vec<Workflow> = t
            .workflows
            .values()
            .filter(|w| w.account_id == account_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn delete_workflow(&self, id: &str) -> Result<()> {
        self.write()?.workflows.remove(id);
        Ok(())
    }

    async fn insert_workflow_result(&self, result: &WorkflowResult) -> Result<()> {
        self.write()?.workflow_results.push(result.clone());
        Ok(())
    }

    async fn update_workflow_result(&self, result: &WorkflowResult) -> Result<()> {
        let mut t = self.write()?;
        match t.workflow_results.iter_mut().find(|r| r.id == result.id) {
            Some(row) => {
                *row = result.clone();
                Ok(())
            }
            None => Err(anyhow!("workflow result {} does not exist", result.id)),
        }
    }

    async fn list_workflow_results(&self, workflow_id: &str) -> Result<Vec<WorkflowResult>> {
        let t = self.read()?;
        Ok(t.workflow_results
            .iter()
            .rev()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn delete_workflow_results(&self, workflow_id: &str) -> Result<u64> {
        let mut t = self.write()?;
        let before = t.workflow_results.len();
        t.workflow_results.retain(|r| r.workflow_id != workflow_id);
        Ok((before - t.workflow_results.len()) as u64)
    }
}

#[async_trait]
impl AppStore for InMemoryStore {
    async fn insert_app(&self, app: &App) -> Result<()> {
        self.write()?.apps.insert(app.id.clone(), app.clone());
        Ok(())
    }

    async fn get_app(&self, id: &str) -> Result<Option<App>> {
        Ok(self.read()?.apps.get(id).cloned())
    }

    async fn list_apps(&self, account_id: &str) -> Result<Vec<App>> {
        let t = self.read()?;
        Ok(t.apps
            .values()
            .filter(|a| a.account_id == account_id)
            .cloned()
            .collect())
    }
}
