//! Wires the services together from a [`Config`].
//!
//! ```text
//!            ┌──────────────┐
//!  Config ──▶│   Platform   │
//!            └──────┬───────┘
//!   store ─ vectors ─ objects ─ locker ─ llm ─ tools ─ code
//!                   │
//!   keyword tables ─┼─ indexing ─ retrieval ─ executor ─ workflows ─ apps
//!                   │
//!               dispatcher (SqliteBus)
//! ```
//!
//! Locks and the bus live in the database, so the CLI and `llmops worker`
//! may run as separate processes.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use llmops_core::llm::{ApproxTokenCounter, LanguageModel, TokenCounter};
use llmops_core::lock::Locker;
use llmops_core::object_store::ObjectStore;
use llmops_core::store::Store;
use llmops_core::vector::VectorStore;

use crate::app::AppService;
use crate::bus::{MessageBus, SqliteBus};
use crate::config::Config;
use crate::db;
use crate::embedding::create_embeddings;
use crate::events::Dispatcher;
use crate::indexing::IndexingService;
use crate::keyword_table::KeywordTableService;
use crate::llm::create_language_model;
use crate::lock::SqliteLocker;
use crate::lua_runtime::LuaCodeRunner;
use crate::object_store::create_object_store;
use crate::retrieval::RetrievalService;
use crate::sqlite_store::SqliteStore;
use crate::sqlite_vector::SqliteVectorStore;
use crate::tools::ToolRegistry;
use crate::workflow::{WorkflowExecutor, WorkflowService};

/// Every service, sharing one pool and one set of collaborators.
pub struct Platform {
    pub pool: SqlitePool,
    pub store: Arc<dyn Store>,
    pub vectors: Arc<dyn VectorStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub llm: Arc<dyn LanguageModel>,
    pub keyword_tables: Arc<KeywordTableService>,
    pub indexing: Arc<IndexingService>,
    pub retrieval: Arc<RetrievalService>,
    pub executor: Arc<WorkflowExecutor>,
    pub workflows: Arc<WorkflowService>,
    pub apps: Arc<AppService>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Platform {
    /// Connect to the configured database and build the services. The
    /// schema must already exist (`llmops init`).
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;

        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
        let embeddings = create_embeddings(&config.embedding)?;
        let vectors: Arc<dyn VectorStore> =
            Arc::new(SqliteVectorStore::new(pool.clone(), embeddings));
        let objects = create_object_store(&config.storage)?;
        let llm = create_language_model(&config.llm)?;
        let locker: Arc<dyn Locker> = Arc::new(SqliteLocker::new(pool.clone()));
        let counter: Arc<dyn TokenCounter> = Arc::new(ApproxTokenCounter);

        let keyword_tables = Arc::new(KeywordTableService::new(
            store.clone(),
            locker.clone(),
            &config.locks,
        ));
        let indexing = Arc::new(IndexingService::new(
            store.clone(),
            vectors.clone(),
            objects.clone(),
            locker,
            counter,
            keyword_tables.clone(),
            config.indexing.clone(),
            &config.locks,
        ));
        let retrieval = Arc::new(RetrievalService::new(
            store.clone(),
            vectors.clone(),
            config.retrieval.clone(),
        ));
        let executor = Arc::new(WorkflowExecutor::new(
            llm.clone(),
            retrieval.clone(),
            Arc::new(ToolRegistry::with_builtins()),
            Arc::new(LuaCodeRunner::new()),
            store.clone(),
            config.workflow.clone(),
        ));
        let workflows = Arc::new(WorkflowService::new(store.clone(), executor.clone()));
        let apps = Arc::new(AppService::new(store.clone(), llm.clone()));

        let bus: Arc<dyn MessageBus> = Arc::new(SqliteBus::new(pool.clone()));
        let dispatcher = Arc::new(Dispatcher::new(bus, indexing.clone(), apps.clone()));

        Ok(Self {
            pool,
            store,
            vectors,
            objects,
            llm,
            keyword_tables,
            indexing,
            retrieval,
            executor,
            workflows,
            apps,
            dispatcher,
        })
    }

    /// Wait for background bookkeeping and close the pool.
    pub async fn close(self) {
        self.retrieval.flush().await;
        self.pool.close().await;
    }
}
