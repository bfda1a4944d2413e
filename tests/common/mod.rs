//! Shared fixtures: every service wired over in-memory backends.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use llmops::app::AppService;
use llmops::bus::InMemoryBus;
use llmops::config::{IndexingConfig, LocksConfig, RetrievalConfig, WorkflowConfig};
use llmops::events::Dispatcher;
use llmops::indexing::{IndexingService, ProcessRuleRequest};
use llmops::keyword_table::KeywordTableService;
use llmops::lua_runtime::LuaCodeRunner;
use llmops::retrieval::RetrievalService;
use llmops::tools::ToolRegistry;
use llmops::workflow::{WorkflowExecutor, WorkflowService};
use llmops_core::chunk::DEFAULT_SEPARATORS;
use llmops_core::embedding::HashEmbeddings;
use llmops_core::llm::{CharTokenCounter, LanguageModel, ScriptedModel};
use llmops_core::lock::{InMemoryLocker, Locker};
use llmops_core::models::{Document, PreProcessRule, RuleSpec, SegmentRule};
use llmops_core::object_store::InMemoryObjectStore;
use llmops_core::store::memory::InMemoryStore;
use llmops_core::store::Store;
use llmops_core::vector::{Filter, InMemoryVectorStore, VectorDocument, VectorStore};

pub const ACCOUNT: &str = "acct-1";

pub struct Harness {
    pub store: Arc<dyn Store>,
    pub vectors: Arc<dyn VectorStore>,
    pub bus: Arc<InMemoryBus>,
    pub locker: Arc<dyn Locker>,
    pub keyword_tables: Arc<KeywordTableService>,
    pub indexing: Arc<IndexingService>,
    pub retrieval: Arc<RetrievalService>,
    pub executor: Arc<WorkflowExecutor>,
    pub workflows: Arc<WorkflowService>,
    pub apps: Arc<AppService>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(
            Arc::new(ScriptedModel::new("ok")),
            Arc::new(InMemoryVectorStore::new(Arc::new(HashEmbeddings::new(512)))),
        )
    }

    pub fn with_model(llm: Arc<dyn LanguageModel>) -> Self {
        Self::with(
            llm,
            Arc::new(InMemoryVectorStore::new(Arc::new(HashEmbeddings::new(512)))),
        )
    }

    pub fn with_store(store: Arc<dyn Store>) -> Self {
        Self::build(
            store,
            Arc::new(ScriptedModel::new("ok")),
            Arc::new(InMemoryVectorStore::new(Arc::new(HashEmbeddings::new(512)))),
        )
    }

    pub fn with(llm: Arc<dyn LanguageModel>, vectors: Arc<dyn VectorStore>) -> Self {
        Self::build(Arc::new(InMemoryStore::new()), llm, vectors)
    }

    fn build(
        store: Arc<dyn Store>,
        llm: Arc<dyn LanguageModel>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        let locks = LocksConfig::default();
        let locker: Arc<dyn Locker> = Arc::new(InMemoryLocker::new());
        let keyword_tables = Arc::new(KeywordTableService::new(
            store.clone(),
            locker.clone(),
            &locks,
        ));
        let indexing = Arc::new(IndexingService::new(
            store.clone(),
            vectors.clone(),
            Arc::new(InMemoryObjectStore::new()),
            locker.clone(),
            Arc::new(CharTokenCounter),
            keyword_tables.clone(),
            IndexingConfig::default(),
            &locks,
        ));
        let retrieval = Arc::new(RetrievalService::new(
            store.clone(),
            vectors.clone(),
            RetrievalConfig::default(),
        ));
        let executor = Arc::new(WorkflowExecutor::new(
            llm.clone(),
            retrieval.clone(),
            Arc::new(ToolRegistry::with_builtins()),
            Arc::new(LuaCodeRunner::new()),
            store.clone(),
            WorkflowConfig::default(),
        ));
        let workflows = Arc::new(WorkflowService::new(store.clone(), executor.clone()));
        let apps = Arc::new(AppService::new(store.clone(), llm));
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = Arc::new(Dispatcher::new(
            bus.clone(),
            indexing.clone(),
            apps.clone(),
        ));
        Self {
            store,
            vectors,
            bus,
            locker,
            keyword_tables,
            indexing,
            retrieval,
            executor,
            workflows,
            apps,
            dispatcher,
        }
    }

    /// Upload `text` as a `.txt` file into a new dataset and build it.
    pub async fn ingest(&self, text: &str, rule: ProcessRuleRequest) -> (String, Document) {
        let dataset = self
            .indexing
            .create_dataset(ACCOUNT, "kb", "")
            .await
            .unwrap();
        let doc = self.ingest_into(&dataset.id, "notes.txt", text, rule).await;
        (dataset.id, doc)
    }

    pub async fn ingest_into(
        &self,
        dataset_id: &str,
        name: &str,
        text: &str,
        rule: ProcessRuleRequest,
    ) -> Document {
        let upload = self
            .indexing
            .upload_file(ACCOUNT, name, text.as_bytes().to_vec())
            .await
            .unwrap();
        let docs = self
            .indexing
            .create_documents(ACCOUNT, dataset_id, &[upload.id], rule)
            .await
            .unwrap();
        self.indexing.build_documents(&[docs[0].id.clone()]).await;
        self.store.get_document(&docs[0].id).await.unwrap().unwrap()
    }
}

/// chunk_size 1000, overlap 50, default separators, whitespace collapsing.
pub fn rule_1000() -> ProcessRuleRequest {
    ProcessRuleRequest::Custom(RuleSpec {
        pre_process_rules: vec![PreProcessRule {
            id: "remove_extra_space".into(),
            enabled: true,
        }],
        segment: SegmentRule {
            chunk_size: 1000,
            chunk_overlap: 50,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        },
    })
}

/// A paragraph of at least `min_chars` built from `lead` and filler words.
pub fn paragraph(lead: &str, filler: &[&str], min_chars: usize) -> String {
    let mut text = lead.to_string();
    let mut i = 0;
    while text.chars().count() < min_chars {
        text.push(' ');
        text.push_str(filler[i % filler.len()]);
        i += 1;
    }
    text.push('.');
    text
}

pub fn two_paragraphs() -> (String, String, String) {
    let one = paragraph(
        "Paragraph one covers harbour logistics",
        &["cranes", "containers", "shipping", "docks", "freight", "berths"],
        600,
    );
    let two = paragraph(
        "Paragraph two covers mountain weather",
        &["two", "snow", "glaciers", "storms", "altitude", "paragraph"],
        600,
    );
    let text = format!("{}\n\n{}", one, two);
    (one, two, text)
}

// ═══════════════════════════════════════════════════════════════
// Graph builders
// ═══════════════════════════════════════════════════════════════

pub fn reference(node: &str, var: &str) -> Value {
    json!({"type": "ref", "ref_node_id": node, "ref_var_name": var})
}

pub fn edge(id: &str, source: &str, source_type: &str, target: &str, target_type: &str) -> Value {
    json!({
        "id": id,
        "source": source, "source_type": source_type,
        "target": target, "target_type": target_type,
    })
}

pub fn handle_edge(
    id: &str,
    source: &str,
    source_type: &str,
    handle: &str,
    target: &str,
    target_type: &str,
) -> Value {
    let mut e = edge(id, source, source_type, target, target_type);
    e["source_handle_id"] = json!(handle);
    e
}

pub fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ═══════════════════════════════════════════════════════════════
// Collaborator doubles
// ═══════════════════════════════════════════════════════════════

/// Vector store whose `add_documents` fails for the first `failures` calls.
pub struct FlakyVectorStore {
    inner: InMemoryVectorStore,
    failures: AtomicUsize,
}

impl FlakyVectorStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryVectorStore::new(Arc::new(HashEmbeddings::new(512))),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl VectorStore for FlakyVectorStore {
    async fn add_documents(&self, docs: Vec<VectorDocument>) -> Result<Vec<String>> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("vector store unavailable");
        }
        self.inner.add_documents(docs).await
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        filter: &Filter,
        score_threshold: f64,
    ) -> Result<Vec<VectorDocument>> {
        self.inner
            .similarity_search(query, k, filter, score_threshold)
            .await
    }

    async fn update_metadata(&self, filter: &Filter, set: Map<String, Value>) -> Result<usize> {
        self.inner.update_metadata(filter, set).await
    }

    async fn delete_by_filter(&self, filter: &Filter) -> Result<usize> {
        self.inner.delete_by_filter(filter).await
    }

    async fn count(&self, filter: &Filter) -> Result<usize> {
        self.inner.count(filter).await
    }
}

/// Model that waits before answering, for cancellation tests.
pub struct SlowModel {
    pub delay: std::time::Duration,
}

#[async_trait]
impl LanguageModel for SlowModel {
    fn model_name(&self) -> &str {
        "slow"
    }

    async fn complete(
        &self,
        _prompt: &str,
        _params: &llmops_core::llm::CompletionParams,
    ) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        Ok("late".to_string())
    }
}
