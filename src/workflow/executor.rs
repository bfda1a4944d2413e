//! Graph walker for validated workflows.
//!
//! Nodes run one at a time in topological order. An edge is live when its
//! source succeeded and, for a question classifier, carries the handle the
//! classifier selected. A node whose in-edges are all dead is skipped,
//! which kills its own out-edges, so skips propagate transitively. The end
//! node always runs and reads skipped references as zero values.
//!
//! Each node transition is sent as a [`DebugEvent`] on an optional bounded
//! channel. Sends block when the consumer lags. Cancelling the run's token,
//! or dropping the receiver, stops the run at the next suspension point and
//! nothing further is emitted.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use llmops_core::llm::LanguageModel;
use llmops_core::models::{new_id, now_ts, WorkflowResultStatus};
use llmops_core::store::Store;
use llmops_core::tool::{CodeRunner, ToolManager};
use llmops_core::workflow::{Edge, Graph, GraphIndex, Node, NodeType, VariableValue};
use llmops_core::{Error, ErrorKind, Result};

use crate::config::WorkflowConfig;
use crate::retrieval::RetrievalService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Final state of one node in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub node_type: NodeType,
    pub title: String,
    pub status: NodeStatus,
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: i64,
    /// Seconds.
    pub latency: f64,
}

impl NodeResult {
    fn skipped(node: &Node) -> Self {
        let now = now_ts();
        Self {
            node_id: node.id.clone(),
            node_type: node.node_type(),
            title: node.title.clone(),
            status: NodeStatus::Skipped,
            inputs: Map::new(),
            outputs: Map::new(),
            error: None,
            started_at: now,
            finished_at: now,
            latency: 0.0,
        }
    }

    fn event(&self) -> DebugEvent {
        DebugEvent {
            id: new_id(),
            node_id: self.node_id.clone(),
            node_type: self.node_type,
            title: self.title.clone(),
            status: self.status,
            inputs: Some(self.inputs.clone()).filter(|m| !m.is_empty()),
            outputs: Some(self.outputs.clone()).filter(|m| !m.is_empty()),
            elapsed_time: self.latency,
            error: self.error.clone(),
        }
    }
}

/// One node transition as streamed to a debugging client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEvent {
    pub id: String,
    pub node_id: String,
    pub node_type: NodeType,
    pub title: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
    /// Seconds since the node started.
    pub elapsed_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: WorkflowResultStatus,
    /// The end node's inputs. Empty when the run failed before the end.
    pub outputs: Map<String, Value>,
    /// Every visited node in execution order.
    pub node_results: Vec<NodeResult>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Seconds.
    pub latency: f64,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == WorkflowResultStatus::Succeeded
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeResult> {
        self.node_results.iter().find(|r| r.node_id == node_id)
    }

    /// The persisted per-node trace.
    pub fn state(&self) -> Value {
        serde_json::to_value(&self.node_results).unwrap_or(Value::Null)
    }
}

/// Routing decided by a node for its out-edges.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum Branch {
    /// Every out-edge is live.
    All,
    /// Only edges carrying this handle are live.
    Handle(String),
    /// No out-edge is live.
    Closed,
}

pub(super) struct Executed {
    pub outputs: Map<String, Value>,
    pub branch: Branch,
}

impl Executed {
    pub fn outputs(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            branch: Branch::All,
        }
    }
}

#[derive(Clone)]
pub(super) struct RunContext {
    pub account_id: String,
    pub cancel: CancellationToken,
    pub events: Option<mpsc::Sender<DebugEvent>>,
    /// Iteration nesting level; 0 for the outer run.
    pub depth: usize,
}

struct NodeRun {
    result: NodeResult,
    branch: Branch,
    error: Option<Error>,
}

pub struct WorkflowExecutor {
    pub(super) llm: Arc<dyn LanguageModel>,
    pub(super) retrieval: Arc<RetrievalService>,
    pub(super) tools: Arc<dyn ToolManager>,
    pub(super) code: Arc<dyn CodeRunner>,
    pub(super) http: reqwest::Client,
    pub(super) store: Arc<dyn Store>,
    pub(super) settings: WorkflowConfig,
}

impl WorkflowExecutor {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        retrieval: Arc<RetrievalService>,
        tools: Arc<dyn ToolManager>,
        code: Arc<dyn CodeRunner>,
        store: Arc<dyn Store>,
        settings: WorkflowConfig,
    ) -> Self {
        Self {
            llm,
            retrieval,
            tools,
            code,
            http: reqwest::Client::new(),
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkflowConfig {
        &self.settings
    }

    /// Run `graph` to completion. Events go to `events` when given.
    pub async fn run(
        &self,
        account_id: &str,
        graph: &Graph,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<DebugEvent>>,
    ) -> RunOutcome {
        let ctx = RunContext {
            account_id: account_id.to_string(),
            cancel,
            events,
            depth: 0,
        };
        self.run_graph(graph, inputs, &ctx).await
    }

    /// Run on a new task, streaming events through a channel sized by
    /// `workflow.debug_channel_capacity`. The receiver closes when the run
    /// ends or is cancelled.
    pub fn spawn(
        self: &Arc<Self>,
        account_id: String,
        graph: Graph,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<DebugEvent>, JoinHandle<RunOutcome>) {
        let (tx, rx) = mpsc::channel(self.settings.debug_channel_capacity.max(1));
        let executor = self.clone();
        let handle = tokio::spawn(async move {
            executor
                .run(&account_id, &graph, inputs, cancel, Some(tx))
                .await
        });
        (rx, handle)
    }

    /// Boxed so iteration nodes can recurse into sub-workflows.
    pub(super) fn run_graph<'a>(
        &'a self,
        graph: &'a Graph,
        inputs: Map<String, Value>,
        ctx: &'a RunContext,
    ) -> Pin<Box<dyn Future<Output = RunOutcome> + Send + 'a>> {
        Box::pin(async move {
            let started = Instant::now();
            let mut node_results = Vec::new();
            let walked = self.walk(graph, &inputs, ctx, &mut node_results).await;
            let latency = started.elapsed().as_secs_f64();
            match walked {
                Ok(outputs) => RunOutcome {
                    status: WorkflowResultStatus::Succeeded,
                    outputs,
                    node_results,
                    error: None,
                    error_kind: None,
                    latency,
                },
                Err(e) => {
                    debug!(error = %e, "workflow run failed");
                    RunOutcome {
                        status: WorkflowResultStatus::Failed,
                        outputs: Map::new(),
                        node_results,
                        error: Some(e.to_string()),
                        error_kind: Some(e.kind()),
                        latency,
                    }
                }
            }
        })
    }

    async fn walk(
        &self,
        graph: &Graph,
        inputs: &Map<String, Value>,
        ctx: &RunContext,
        node_results: &mut Vec<NodeResult>,
    ) -> Result<Map<String, Value>> {
        let order = GraphIndex::build(graph)
            .topological_order()
            .ok_or_else(|| Error::Fatal("workflow graph contains a cycle".to_string()))?;

        let mut state: HashMap<String, NodeResult> = HashMap::new();
        let mut branches: HashMap<String, Branch> = HashMap::new();
        let mut final_outputs = Map::new();
        let mut deferred: Option<Error> = None;

        for node_id in &order {
            let node = graph
                .node(node_id)
                .ok_or_else(|| Error::Fatal(format!("node {} vanished from graph", node_id)))?;
            let kind = node.node_type();

            if kind != NodeType::Start && kind != NodeType::End {
                let live = graph
                    .edges
                    .iter()
                    .filter(|e| &e.target == node_id)
                    .any(|e| edge_is_live(e, &state, &branches));
                if !live {
                    let result = NodeResult::skipped(node);
                    self.emit(ctx, result.event()).await?;
                    debug!(node_id = %node.id, "node skipped");
                    node_results.push(result.clone());
                    state.insert(node_id.clone(), result);
                    continue;
                }
            }

            let run = self.run_node(node, inputs, &state, ctx).await?;
            node_results.push(run.result.clone());
            if kind == NodeType::End && run.error.is_none() {
                final_outputs = run.result.outputs.clone();
            }
            branches.insert(node_id.clone(), run.branch);
            state.insert(node_id.clone(), run.result);

            if let Some(err) = run.error {
                if kind == NodeType::QuestionClassifier {
                    // Routes nowhere; the run goes on but ends failed.
                    branches.insert(node_id.clone(), Branch::Closed);
                    deferred.get_or_insert(err);
                } else {
                    return Err(err);
                }
            }
        }

        match deferred {
            Some(err) => Err(err),
            None => Ok(final_outputs),
        }
    }

    async fn run_node(
        &self,
        node: &Node,
        run_inputs: &Map<String, Value>,
        state: &HashMap<String, NodeResult>,
        ctx: &RunContext,
    ) -> Result<NodeRun> {
        let started = Instant::now();
        let started_at = now_ts();
        let resolved = if node.node_type() == NodeType::Start {
            start_inputs(node, run_inputs)
        } else {
            resolve_inputs(node, state)
        };

        let mut result = NodeResult {
            node_id: node.id.clone(),
            node_type: node.node_type(),
            title: node.title.clone(),
            status: NodeStatus::Running,
            inputs: resolved.as_ref().cloned().unwrap_or_default(),
            outputs: Map::new(),
            error: None,
            started_at,
            finished_at: started_at,
            latency: 0.0,
        };
        self.emit(ctx, result.event()).await?;

        let executed = match resolved {
            Ok(inputs) => {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
                    r = self.execute(node, inputs, ctx) => r,
                }
            }
            Err(e) => Err(e),
        };

        result.finished_at = now_ts();
        result.latency = started.elapsed().as_secs_f64();
        match executed {
            Ok(executed) => {
                result.status = NodeStatus::Succeeded;
                result.outputs = executed.outputs;
                self.emit(ctx, result.event()).await?;
                debug!(node_id = %node.id, node_type = %node.node_type(), latency = result.latency, "node succeeded");
                Ok(NodeRun {
                    result,
                    branch: executed.branch,
                    error: None,
                })
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                result.status = NodeStatus::Failed;
                result.error = Some(e.to_string());
                self.emit(ctx, result.event()).await?;
                warn!(node_id = %node.id, node_type = %node.node_type(), error = %e, "node failed");
                Ok(NodeRun {
                    result,
                    branch: Branch::Closed,
                    error: Some(e),
                })
            }
        }
    }

    async fn emit(&self, ctx: &RunContext, event: DebugEvent) -> Result<()> {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(tx) = &ctx.events else {
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
            sent = tx.send(event) => sent.map_err(|_| Error::Cancelled),
        }
    }
}

fn edge_is_live(
    edge: &Edge,
    state: &HashMap<String, NodeResult>,
    branches: &HashMap<String, Branch>,
) -> bool {
    let succeeded = state
        .get(&edge.source)
        .is_some_and(|r| r.status == NodeStatus::Succeeded);
    if !succeeded {
        return false;
    }
    match branches.get(&edge.source) {
        Some(Branch::Handle(handle)) => edge.source_handle_id.as_deref() == Some(handle.as_str()),
        Some(Branch::Closed) => false,
        Some(Branch::All) | None => true,
    }
}

/// The start node's parameters from the caller's inputs.
fn start_inputs(node: &Node, inputs: &Map<String, Value>) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for var in &node.inputs {
        let value = match inputs.get(&var.name) {
            Some(v) if !v.is_null() => v.clone(),
            _ if var.required => {
                return Err(Error::validation(format!(
                    "missing required workflow input {:?}",
                    var.name
                )))
            }
            _ => match &var.value {
                VariableValue::Constant { content } if !content.is_null() => content.clone(),
                _ => var.var_type.zero_value(),
            },
        };
        out.insert(var.name.clone(), value);
    }
    Ok(out)
}

/// Resolve a node's inputs against the outputs of nodes already run.
fn resolve_inputs(node: &Node, state: &HashMap<String, NodeResult>) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for var in &node.inputs {
        let value = match &var.value {
            VariableValue::Constant { content } | VariableValue::Generated { content } => {
                if content.is_null() {
                    var.var_type.zero_value()
                } else {
                    content.clone()
                }
            }
            VariableValue::Ref {
                ref_node_id,
                ref_var_name,
            } => {
                let source = state.get(ref_node_id);
                let found = source
                    .filter(|r| r.status == NodeStatus::Succeeded)
                    .and_then(|r| r.outputs.get(ref_var_name));
                let skipped = source.is_some_and(|r| r.status == NodeStatus::Skipped);
                match found {
                    Some(v) => v.clone(),
                    None if var.required && !skipped => {
                        return Err(Error::validation(format!(
                            "node {}: required input {:?} references {}.{} which has no value",
                            node.id, var.name, ref_node_id, ref_var_name
                        )))
                    }
                    None => var.var_type.zero_value(),
                }
            }
        };
        out.insert(var.name.clone(), value);
    }
    Ok(out)
}

/// Recover a typed error raised inside a collaborator.
pub(super) fn fold_error(err: anyhow::Error) -> Error {
    match err.downcast::<Error>() {
        Ok(e) => e,
        Err(e) => Error::Transient(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmops_core::workflow::{Variable, VariableType};

    fn ref_var(name: &str, node: &str, var: &str, required: bool) -> Variable {
        let mut v = Variable::new(name, VariableType::String);
        v.required = required;
        v.value = VariableValue::Ref {
            ref_node_id: node.into(),
            ref_var_name: var.into(),
        };
        v
    }

    fn node_with_inputs(inputs: Vec<Variable>) -> Node {
        serde_json::from_value::<Node>(serde_json::json!({
            "id": "n", "title": "n", "node_type": "end"
        }))
        .map(|mut n| {
            n.inputs = inputs;
            n
        })
        .unwrap()
    }

    fn result(id: &str, status: NodeStatus, outputs: Value) -> NodeResult {
        NodeResult {
            node_id: id.into(),
            node_type: NodeType::TemplateTransform,
            title: id.into(),
            status,
            inputs: Map::new(),
            outputs: outputs.as_object().cloned().unwrap_or_default(),
            error: None,
            started_at: 0,
            finished_at: 0,
            latency: 0.0,
        }
    }

    #[test]
    fn test_resolve_reads_predecessor_outputs() {
        let mut state = HashMap::new();
        state.insert(
            "a".to_string(),
            result("a", NodeStatus::Succeeded, serde_json::json!({"output": "hi"})),
        );
        let node = node_with_inputs(vec![ref_var("x", "a", "output", true)]);
        let inputs = resolve_inputs(&node, &state).unwrap();
        assert_eq!(inputs["x"], "hi");
    }

    #[test]
    fn test_resolve_missing_required_is_error() {
        let mut state = HashMap::new();
        state.insert(
            "a".to_string(),
            result("a", NodeStatus::Succeeded, serde_json::json!({})),
        );
        let node = node_with_inputs(vec![ref_var("x", "a", "output", true)]);
        assert!(resolve_inputs(&node, &state).is_err());
    }

    #[test]
    fn test_resolve_optional_and_skipped_fall_back_to_zero() {
        let mut state = HashMap::new();
        state.insert(
            "skipped".to_string(),
            result("skipped", NodeStatus::Skipped, serde_json::json!({})),
        );
        let node = node_with_inputs(vec![
            ref_var("a", "missing", "output", false),
            ref_var("b", "skipped", "output", true),
        ]);
        let inputs = resolve_inputs(&node, &state).unwrap();
        assert_eq!(inputs["a"], "");
        assert_eq!(inputs["b"], "");
    }

    #[test]
    fn test_start_inputs_require_declared_values() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "id": "s", "title": "Start", "node_type": "start",
            "inputs": [
                {"name": "query", "type": "string", "required": true},
                {"name": "limit", "type": "int"}
            ]
        }))
        .unwrap();
        let ok = start_inputs(&node, serde_json::json!({"query": "q"}).as_object().unwrap()).unwrap();
        assert_eq!(ok["query"], "q");
        assert_eq!(ok["limit"], 0);
        assert!(start_inputs(&node, &Map::new()).is_err());
    }

    #[test]
    fn test_classifier_edges_follow_selected_handle() {
        let mut state = HashMap::new();
        state.insert(
            "c".to_string(),
            result("c", NodeStatus::Succeeded, serde_json::json!({})),
        );
        let mut branches = HashMap::new();
        branches.insert("c".to_string(), Branch::Handle("h1".to_string()));
        let edge = |handle: &str| Edge {
            id: new_id(),
            source: "c".into(),
            source_type: NodeType::QuestionClassifier,
            target: "t".into(),
            target_type: NodeType::TemplateTransform,
            source_handle_id: Some(handle.to_string()),
        };
        assert!(edge_is_live(&edge("h1"), &state, &branches));
        assert!(!edge_is_live(&edge("h2"), &state, &branches));
    }

    #[test]
    fn test_fold_error_keeps_typed_kind() {
        let err = fold_error(anyhow::Error::new(Error::not_found("tool x")));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = fold_error(anyhow::anyhow!("socket closed"));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
