//! Workflow lifecycle: create, edit the draft, debug, publish.
//!
//! ```text
//! create ──► draft ──update──► draft (is_debug_passed = false)
//!              │
//!            debug ──success──► is_debug_passed = true
//!              │
//!           publish ──► published (graph = draft) ──cancel──► draft
//! ```
//!
//! Drafts are stored normalized: saving a draft runs the validator with the
//! caller's accessible datasets, so an invalid graph is never persisted.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use llmops_core::models::{
    new_id, now_ts, Workflow, WorkflowResult, WorkflowResultStatus, WorkflowStatus,
};
use llmops_core::store::{DatasetStore, Store, WorkflowStore};
use llmops_core::workflow::validator::referenced_dataset_ids;
use llmops_core::workflow::{validate_graph, validate_workflow_meta, Graph, ValidationContext};
use llmops_core::{Error, Result};

use super::executor::{DebugEvent, WorkflowExecutor};

/// Fields a caller sets on create or update.
#[derive(Debug, Clone, Default)]
pub struct WorkflowMeta {
    pub name: String,
    pub tool_call_name: String,
    pub icon: String,
    pub description: String,
}

/// A debug run in flight.
pub struct DebugRun {
    pub result_id: String,
    pub events: mpsc::Receiver<DebugEvent>,
    /// Resolves to the persisted result once the run ends.
    pub handle: JoinHandle<Result<WorkflowResult>>,
}

pub struct WorkflowService {
    store: Arc<dyn Store>,
    executor: Arc<WorkflowExecutor>,
}

fn empty_graph() -> Value {
    serde_json::json!({ "nodes": [], "edges": [] })
}

impl WorkflowService {
    pub fn new(store: Arc<dyn Store>, executor: Arc<WorkflowExecutor>) -> Self {
        Self { store, executor }
    }

    pub async fn create(&self, account_id: &str, meta: WorkflowMeta) -> Result<Workflow> {
        validate_workflow_meta(&meta.tool_call_name, &meta.name, &meta.description)?;
        self.ensure_tool_call_name_free(account_id, &meta.tool_call_name, None)
            .await?;

        let now = now_ts();
        let workflow = Workflow {
            id: new_id(),
            account_id: account_id.to_string(),
            name: meta.name.trim().to_string(),
            tool_call_name: meta.tool_call_name,
            icon: meta.icon,
            description: meta.description,
            graph: empty_graph(),
            draft_graph: empty_graph(),
            is_debug_passed: false,
            status: WorkflowStatus::Draft,
            published_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_workflow(&workflow).await?;
        info!(workflow_id = %workflow.id, account_id, "workflow created");
        Ok(workflow)
    }

    pub async fn update(&self, account_id: &str, id: &str, meta: WorkflowMeta) -> Result<Workflow> {
        validate_workflow_meta(&meta.tool_call_name, &meta.name, &meta.description)?;
        let mut workflow = self.get(account_id, id).await?;
        self.ensure_tool_call_name_free(account_id, &meta.tool_call_name, Some(id))
            .await?;
        workflow.name = meta.name.trim().to_string();
        workflow.tool_call_name = meta.tool_call_name;
        workflow.icon = meta.icon;
        workflow.description = meta.description;
        workflow.updated_at = now_ts();
        self.store.update_workflow(&workflow).await?;
        Ok(workflow)
    }

    async fn ensure_tool_call_name_free(
        &self,
        account_id: &str,
        tool_call_name: &str,
        except: Option<&str>,
    ) -> Result<()> {
        let existing = self
            .store
            .find_workflow_by_tool_call_name(account_id, tool_call_name)
            .await?;
        match existing {
            Some(w) if Some(w.id.as_str()) != except => Err(Error::Conflict(format!(
                "tool_call_name {:?} is already used by workflow {}",
                tool_call_name, w.id
            ))),
            _ => Ok(()),
        }
    }

    /// A workflow owned by `account_id`.
    pub async fn get(&self, account_id: &str, id: &str) -> Result<Workflow> {
        let workflow = self
            .store
            .get_workflow(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("workflow {}", id)))?;
        if workflow.account_id != account_id {
            return Err(Error::Forbidden(format!(
                "workflow {} belongs to another account",
                id
            )));
        }
        Ok(workflow)
    }

    pub async fn list(&self, account_id: &str) -> Result<Vec<Workflow>> {
        Ok(self.store.list_workflows(account_id).await?)
    }

    pub async fn delete(&self, account_id: &str, id: &str) -> Result<()> {
        self.get(account_id, id).await?;
        self.store.delete_workflow_results(id).await?;
        self.store.delete_workflow(id).await?;
        info!(workflow_id = id, "workflow deleted");
        Ok(())
    }

    /// Validate a raw graph for this account, keeping only datasets it owns.
    /// `workflow_id` names the workflow being edited, if any.
    pub async fn normalize(
        &self,
        account_id: &str,
        workflow_id: Option<&str>,
        raw: &Value,
    ) -> Result<Graph> {
        let referenced = referenced_dataset_ids(raw);
        let accessible: HashSet<String> = if referenced.is_empty() {
            HashSet::new()
        } else {
            self.store
                .list_owned_datasets(account_id, &referenced)
                .await?
                .into_iter()
                .map(|d| d.id)
                .collect()
        };
        let ctx = ValidationContext {
            workflow_id: workflow_id.map(str::to_string),
            accessible_dataset_ids: Some(accessible),
        };
        validate_graph(raw, &ctx)
    }

    /// Replace the draft graph. Clears `is_debug_passed`.
    pub async fn update_draft_graph(
        &self,
        account_id: &str,
        id: &str,
        raw: &Value,
    ) -> Result<Workflow> {
        let mut workflow = self.get(account_id, id).await?;
        let graph = self.normalize(account_id, Some(id), raw).await?;
        workflow.draft_graph = graph.to_value();
        workflow.is_debug_passed = false;
        workflow.updated_at = now_ts();
        self.store.update_workflow(&workflow).await?;
        Ok(workflow)
    }

    pub async fn get_draft_graph(&self, account_id: &str, id: &str) -> Result<Value> {
        Ok(self.get(account_id, id).await?.draft_graph)
    }

    /// Run the draft with event streaming. A running result row is written
    /// first and updated when the run ends; success sets `is_debug_passed`.
    pub async fn debug(
        &self,
        account_id: &str,
        id: &str,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<DebugRun> {
        let workflow = self.get(account_id, id).await?;
        let graph = self
            .normalize(account_id, Some(id), &workflow.draft_graph)
            .await?;

        let now = now_ts();
        let record = WorkflowResult {
            id: new_id(),
            account_id: account_id.to_string(),
            workflow_id: workflow.id.clone(),
            graph: graph.to_value(),
            state: Value::Array(Vec::new()),
            latency: 0.0,
            status: WorkflowResultStatus::Running,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_workflow_result(&record).await?;

        let capacity = self.executor.settings().debug_channel_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let result_id = record.id.clone();
        let handle = tokio::spawn(finish_debug_run(
            self.store.clone(),
            self.executor.clone(),
            graph,
            inputs,
            cancel,
            tx,
            record,
        ));
        Ok(DebugRun {
            result_id,
            events: rx,
            handle,
        })
    }

    /// Publish the draft. Requires a passing debug run since the last edit.
    pub async fn publish(&self, account_id: &str, id: &str) -> Result<Workflow> {
        let mut workflow = self.get(account_id, id).await?;
        if !workflow.is_debug_passed {
            return Err(Error::validation(
                "workflow draft must pass a debug run before publishing",
            ));
        }
        let graph = self
            .normalize(account_id, Some(id), &workflow.draft_graph)
            .await?;
        let now = now_ts();
        workflow.graph = graph.to_value();
        workflow.status = WorkflowStatus::Published;
        workflow.published_at = Some(now);
        workflow.is_debug_passed = false;
        workflow.updated_at = now;
        self.store.update_workflow(&workflow).await?;
        info!(workflow_id = id, "workflow published");
        Ok(workflow)
    }

    pub async fn cancel_publish(&self, account_id: &str, id: &str) -> Result<Workflow> {
        let mut workflow = self.get(account_id, id).await?;
        if workflow.status != WorkflowStatus::Published {
            return Err(Error::validation(format!("workflow {} is not published", id)));
        }
        workflow.graph = empty_graph();
        workflow.status = WorkflowStatus::Draft;
        workflow.published_at = None;
        workflow.updated_at = now_ts();
        self.store.update_workflow(&workflow).await?;
        info!(workflow_id = id, "workflow unpublished");
        Ok(workflow)
    }

    /// Persisted runs, newest first.
    pub async fn list_results(&self, account_id: &str, id: &str) -> Result<Vec<WorkflowResult>> {
        self.get(account_id, id).await?;
        Ok(self.store.list_workflow_results(id).await?)
    }
}

async fn finish_debug_run(
    store: Arc<dyn Store>,
    executor: Arc<WorkflowExecutor>,
    graph: Graph,
    inputs: Map<String, Value>,
    cancel: CancellationToken,
    events: mpsc::Sender<DebugEvent>,
    mut record: WorkflowResult,
) -> Result<WorkflowResult> {
    let outcome = executor
        .run(&record.account_id, &graph, inputs, cancel, Some(events))
        .await;

    record.state = outcome.state();
    record.latency = outcome.latency;
    record.status = outcome.status;
    record.updated_at = now_ts();
    store.update_workflow_result(&record).await?;

    if outcome.succeeded() {
        if let Some(mut workflow) = store.get_workflow(&record.workflow_id).await? {
            workflow.is_debug_passed = true;
            workflow.updated_at = now_ts();
            store.update_workflow(&workflow).await?;
        }
    }
    info!(
        workflow_id = %record.workflow_id,
        status = %record.status,
        latency = record.latency,
        "debug run finished"
    );
    Ok(record)
}
