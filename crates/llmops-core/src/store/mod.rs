//! Relational storage abstraction.
//!
//! Repositories are split by aggregate so that a service can depend on
//! only what it touches; [`Store`] is the union every backend implements.
//! All methods return [`anyhow::Result`]; services fold failures into
//! [`Error::Transient`](crate::error::Error::Transient).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! | Trait | Rows |
//! |-------|------|
//! | [`DatasetStore`] | datasets, dataset queries |
//! | [`DocumentStore`] | upload files, process rules, documents |
//! | [`SegmentStore`] | segments |
//! | [`KeywordTableStore`] | keyword tables |
//! | [`WorkflowStore`] | workflows, workflow results |
//! | [`AppStore`] | apps |

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    App, Dataset, DatasetQuery, Document, KeywordTable, ProcessRule, Segment, UploadFile,
    Workflow, WorkflowResult,
};

#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn insert_dataset(&self, dataset: &Dataset) -> Result<()>;

    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>>;

    /// Datasets among `ids` owned by `account_id`, in `ids` order.
    async fn list_owned_datasets(&self, account_id: &str, ids: &[String]) -> Result<Vec<Dataset>>;

    async fn delete_dataset(&self, id: &str) -> Result<()>;

    async fn insert_dataset_query(&self, query: &DatasetQuery) -> Result<()>;

    /// Newest first.
    async fn list_dataset_queries(&self, dataset_id: &str, limit: usize)
        -> Result<Vec<DatasetQuery>>;

    async fn delete_dataset_queries(&self, dataset_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_upload_file(&self, file: &UploadFile) -> Result<()>;

    async fn get_upload_file(&self, id: &str) -> Result<Option<UploadFile>>;

    async fn insert_process_rule(&self, rule: &ProcessRule) -> Result<()>;

    async fn get_process_rule(&self, id: &str) -> Result<Option<ProcessRule>>;

    async fn insert_document(&self, doc: &Document) -> Result<()>;

    /// Replace every column of an existing document row.
    async fn update_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Ordered by position.
    async fn list_documents(&self, dataset_id: &str) -> Result<Vec<Document>>;

    /// Highest document position in the dataset, 0 when empty.
    async fn max_document_position(&self, dataset_id: &str) -> Result<i64>;

    async fn delete_document(&self, id: &str) -> Result<()>;

    async fn delete_documents_by_dataset(&self, dataset_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait SegmentStore: Send + Sync {
    async fn insert_segment(&self, segment: &Segment) -> Result<()>;

    /// Replace every column of an existing segment row.
    async fn update_segment(&self, segment: &Segment) -> Result<()>;

    async fn get_segment(&self, id: &str) -> Result<Option<Segment>>;

    async fn get_segment_by_position(&self, document_id: &str, position: i64)
        -> Result<Option<Segment>>;

    /// Highest segment position in the document, 0 when empty.
    async fn max_segment_position(&self, document_id: &str) -> Result<i64>;

    /// Ordered by position.
    async fn list_segments_by_document(&self, document_id: &str) -> Result<Vec<Segment>>;

    /// Segments among `ids` whose dataset is in `dataset_ids`. Order unspecified.
    async fn list_segments_by_ids(
        &self,
        ids: &[String],
        dataset_ids: &[String],
    ) -> Result<Vec<Segment>>;

    /// `hit_count += 1` for every listed segment, atomically.
    async fn increment_hit_count(&self, ids: &[String]) -> Result<()>;

    async fn delete_segments_by_ids(&self, ids: &[String]) -> Result<u64>;

    async fn delete_segments_by_document(&self, document_id: &str) -> Result<u64>;

    async fn delete_segments_by_dataset(&self, dataset_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait KeywordTableStore: Send + Sync {
    async fn get_keyword_table(&self, dataset_id: &str) -> Result<Option<KeywordTable>>;

    /// Insert or whole-row replace, keyed by dataset.
    async fn save_keyword_table(&self, table: &KeywordTable) -> Result<()>;

    async fn list_keyword_tables(&self, dataset_ids: &[String]) -> Result<Vec<KeywordTable>>;

    async fn delete_keyword_table(&self, dataset_id: &str) -> Result<()>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<()>;

    async fn update_workflow(&self, workflow: &Workflow) -> Result<()>;

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;

    async fn find_workflow_by_tool_call_name(
        &self,
        account_id: &str,
        tool_call_name: &str,
    ) -> Result<Option<Workflow>>;

    async fn list_workflows(&self, account_id: &str) -> Result<Vec<Workflow>>;

    async fn delete_workflow(&self, id: &str) -> Result<()>;

    async fn insert_workflow_result(&self, result: &WorkflowResult) -> Result<()>;

    async fn update_workflow_result(&self, result: &WorkflowResult) -> Result<()>;

    /// Newest first.
    async fn list_workflow_results(&self, workflow_id: &str) -> Result<Vec<WorkflowResult>>;

    async fn delete_workflow_results(&self, workflow_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait AppStore: Send + Sync {
    async fn insert_app(&self, app: &App) -> Result<()>;

    async fn get_app(&self, id: &str) -> Result<Option<App>>;

    async fn list_apps(&self, account_id: &str) -> Result<Vec<App>>;
}

/// Every repository in one object.
pub trait Store:
    DatasetStore + DocumentStore + SegmentStore + KeywordTableStore + WorkflowStore + AppStore
{
}

impl<T> Store for T where
    T: DatasetStore + DocumentStore + SegmentStore + KeywordTableStore + WorkflowStore + AppStore
{
}
