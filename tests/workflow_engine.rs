//! Workflow executor and lifecycle service.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use common::*;
use llmops::workflow::{DebugRun, NodeStatus, WorkflowMeta};
use llmops_core::llm::ScriptedModel;
use llmops_core::models::{WorkflowResult, WorkflowResultStatus, WorkflowStatus};
use llmops_core::workflow::{validate_graph, Graph, ValidationContext};
use llmops_core::ErrorKind;

fn validated(raw: &Value) -> Graph {
    validate_graph(raw, &ValidationContext::default()).unwrap()
}

/// Drain the event stream, then wait for the persisted result.
async fn finish(mut run: DebugRun) -> WorkflowResult {
    while run.events.recv().await.is_some() {}
    run.handle.await.unwrap().unwrap()
}

fn meta(tool_call_name: &str) -> WorkflowMeta {
    WorkflowMeta {
        name: tool_call_name.replace('_', " "),
        tool_call_name: tool_call_name.to_string(),
        icon: String::new(),
        description: "test workflow".to_string(),
    }
}

/// start ─┬─▶ a ─┬─▶ end
///        └─▶ b ─┘
fn diamond() -> Value {
    json!({
        "nodes": [
            {"id": "start", "title": "Start", "node_type": "start",
             "inputs": [{"name": "q", "type": "string", "required": true}]},
            {"id": "a", "title": "Upper", "node_type": "template_transform",
             "template": "A:{{q}}",
             "inputs": [{"name": "q", "type": "string", "value": reference("start", "q")}]},
            {"id": "b", "title": "Lower", "node_type": "template_transform",
             "template": "B:{{q}}",
             "inputs": [{"name": "q", "type": "string", "value": reference("start", "q")}]},
            {"id": "end", "title": "End", "node_type": "end",
             "inputs": [
                {"name": "a", "type": "string", "value": reference("a", "output")},
                {"name": "b", "type": "string", "value": reference("b", "output")}
             ]},
        ],
        "edges": [
            edge("e1", "start", "start", "a", "template_transform"),
            edge("e2", "start", "start", "b", "template_transform"),
            edge("e3", "a", "template_transform", "end", "end"),
            edge("e4", "b", "template_transform", "end", "end"),
        ]
    })
}

/// start ─▶ classify ─x─▶ tx ─▶ end
///                   └y─▶ ty ─┘
fn classifier_graph() -> Value {
    json!({
        "nodes": [
            {"id": "start", "title": "Start", "node_type": "start",
             "inputs": [{"name": "q", "type": "string", "required": true}]},
            {"id": "classify", "title": "Route", "node_type": "question_classifier",
             "classes": [
                {"query": "questions about fruit", "source_handle_id": "x"},
                {"query": "everything else", "source_handle_id": "y"}
             ],
             "inputs": [{"name": "query", "type": "string", "value": reference("start", "q")}]},
            {"id": "tx", "title": "X branch", "node_type": "template_transform", "template": "x"},
            {"id": "ty", "title": "Y branch", "node_type": "template_transform", "template": "y"},
            {"id": "end", "title": "End", "node_type": "end",
             "inputs": [{"name": "result", "type": "string", "value": reference("tx", "output")}]},
        ],
        "edges": [
            edge("e1", "start", "start", "classify", "question_classifier"),
            handle_edge("e2", "classify", "question_classifier", "x", "tx", "template_transform"),
            handle_edge("e3", "classify", "question_classifier", "y", "ty", "template_transform"),
            edge("e4", "tx", "template_transform", "end", "end"),
            edge("e5", "ty", "template_transform", "end", "end"),
        ]
    })
}

fn llm_graph() -> Value {
    json!({
        "nodes": [
            {"id": "start", "title": "Start", "node_type": "start",
             "inputs": [{"name": "q", "type": "string", "required": true}]},
            {"id": "llm", "title": "Answer", "node_type": "llm", "prompt": "Answer: {{q}}",
             "inputs": [{"name": "q", "type": "string", "value": reference("start", "q")}]},
            {"id": "end", "title": "End", "node_type": "end",
             "inputs": [{"name": "answer", "type": "string", "value": reference("llm", "response")}]},
        ],
        "edges": [
            edge("e1", "start", "start", "llm", "llm"),
            edge("e2", "llm", "llm", "end", "end"),
        ]
    })
}

#[tokio::test]
async fn test_every_node_runs_once_in_edge_order() {
    let h = Harness::new();
    let graph = validated(&diamond());
    let (mut events, handle) = h.executor.spawn(
        ACCOUNT.to_string(),
        graph.clone(),
        inputs(&[("q", json!("hi"))]),
        CancellationToken::new(),
    );

    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    let outcome = handle.await.unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.outputs["a"], json!("A:hi"));
    assert_eq!(outcome.outputs["b"], json!("B:hi"));

    let mut finished_at: HashMap<String, usize> = HashMap::new();
    let mut started_at: HashMap<String, usize> = HashMap::new();
    for (i, event) in seen.iter().enumerate() {
        match event.status {
            NodeStatus::Running => {
                assert!(started_at.insert(event.node_id.clone(), i).is_none());
            }
            NodeStatus::Succeeded => {
                assert!(finished_at.insert(event.node_id.clone(), i).is_none());
            }
            other => panic!("unexpected status {:?}", other),
        }
    }
    assert_eq!(finished_at.len(), 4);
    for edge in &graph.edges {
        assert!(
            finished_at[&edge.source] < started_at[&edge.target],
            "{} must finish before {} starts",
            edge.source,
            edge.target
        );
    }
}

#[tokio::test]
async fn test_classifier_runs_selected_branch_only() {
    let model = ScriptedModel::new("y").with_rule("Question: apples", "x");
    let h = Harness::with_model(Arc::new(model));
    let graph = validated(&classifier_graph());

    let outcome = h
        .executor
        .run(
            ACCOUNT,
            &graph,
            inputs(&[("q", json!("apples"))]),
            CancellationToken::new(),
            None,
        )
        .await;
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(Value::Object(outcome.outputs.clone()), json!({"result": "x"}));
    assert_eq!(outcome.node("tx").unwrap().status, NodeStatus::Succeeded);
    assert_eq!(outcome.node("ty").unwrap().status, NodeStatus::Skipped);
    assert_eq!(outcome.node("end").unwrap().status, NodeStatus::Succeeded);
}

#[tokio::test]
async fn test_classifier_other_branch_leaves_unreached_refs_empty() {
    let model = ScriptedModel::new("y").with_rule("Question: apples", "x");
    let h = Harness::with_model(Arc::new(model));
    let graph = validated(&classifier_graph());

    let outcome = h
        .executor
        .run(
            ACCOUNT,
            &graph,
            inputs(&[("q", json!("the weather"))]),
            CancellationToken::new(),
            None,
        )
        .await;
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.node("tx").unwrap().status, NodeStatus::Skipped);
    assert_eq!(outcome.node("ty").unwrap().status, NodeStatus::Succeeded);
    assert_eq!(outcome.outputs["result"], json!(""));
}

#[tokio::test]
async fn test_missing_required_input_fails_run() {
    let h = Harness::new();
    let outcome = h
        .executor
        .run(
            ACCOUNT,
            &validated(&diamond()),
            inputs(&[]),
            CancellationToken::new(),
            None,
        )
        .await;
    assert_eq!(outcome.status, WorkflowResultStatus::Failed);
    assert_eq!(outcome.error_kind, Some(ErrorKind::Validation));
    assert_eq!(outcome.node("start").unwrap().status, NodeStatus::Failed);
}

#[tokio::test]
async fn test_iteration_maps_published_sub_workflow() {
    let h = Harness::new();

    let sub = h.workflows.create(ACCOUNT, meta("exclaim")).await.unwrap();
    let sub_graph = json!({
        "nodes": [
            {"id": "start", "title": "Start", "node_type": "start",
             "inputs": [{"name": "text", "type": "string", "required": true}]},
            {"id": "bang", "title": "Bang", "node_type": "template_transform",
             "template": "{{text}}!",
             "inputs": [{"name": "text", "type": "string", "value": reference("start", "text")}]},
            {"id": "end", "title": "End", "node_type": "end",
             "inputs": [{"name": "processed_input", "type": "string",
                         "value": reference("bang", "output")}]},
        ],
        "edges": [
            edge("e1", "start", "start", "bang", "template_transform"),
            edge("e2", "bang", "template_transform", "end", "end"),
        ]
    });
    h.workflows
        .update_draft_graph(ACCOUNT, &sub.id, &sub_graph)
        .await
        .unwrap();
    let run = h
        .workflows
        .debug(
            ACCOUNT,
            &sub.id,
            inputs(&[("text", json!("probe"))]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let result = finish(run).await;
    assert_eq!(result.status, WorkflowResultStatus::Succeeded);
    h.workflows.publish(ACCOUNT, &sub.id).await.unwrap();

    let outer = validated(&json!({
        "nodes": [
            {"id": "start", "title": "Start", "node_type": "start",
             "inputs": [{"name": "items", "type": "array_string", "required": true}]},
            {"id": "loop", "title": "Loop", "node_type": "iteration",
             "workflow_ids": [sub.id],
             "inputs": [{"name": "inputs", "type": "array_string",
                         "value": reference("start", "items")}]},
            {"id": "end", "title": "End", "node_type": "end",
             "inputs": [{"name": "outputs", "type": "array_string",
                         "value": reference("loop", "outputs")}]},
        ],
        "edges": [
            edge("e1", "start", "start", "loop", "iteration"),
            edge("e2", "loop", "iteration", "end", "end"),
        ]
    }));
    let outcome = h
        .executor
        .run(
            ACCOUNT,
            &outer,
            inputs(&[("items", json!(["a", "b"]))]),
            CancellationToken::new(),
            None,
        )
        .await;
    assert!(outcome.succeeded(), "{:?}", outcome.error);

    let items = outcome.outputs["outputs"].as_array().unwrap();
    let decoded: Vec<Value> = items
        .iter()
        .map(|s| serde_json::from_str(s.as_str().unwrap()).unwrap())
        .collect();
    assert_eq!(
        decoded,
        vec![
            json!({"processed_input": "a!"}),
            json!({"processed_input": "b!"})
        ]
    );
}

#[tokio::test]
async fn test_iteration_rejects_unpublished_workflow() {
    let h = Harness::new();
    let sub = h.workflows.create(ACCOUNT, meta("draft_only")).await.unwrap();
    let outer = validated(&json!({
        "nodes": [
            {"id": "start", "title": "Start", "node_type": "start",
             "inputs": [{"name": "items", "type": "array_string"}]},
            {"id": "loop", "title": "Loop", "node_type": "iteration",
             "workflow_ids": [sub.id],
             "inputs": [{"name": "inputs", "type": "array_string",
                         "value": reference("start", "items")}]},
            {"id": "end", "title": "End", "node_type": "end"},
        ],
        "edges": [
            edge("e1", "start", "start", "loop", "iteration"),
            edge("e2", "loop", "iteration", "end", "end"),
        ]
    }));
    let outcome = h
        .executor
        .run(
            ACCOUNT,
            &outer,
            inputs(&[("items", json!(["a"]))]),
            CancellationToken::new(),
            None,
        )
        .await;
    assert_eq!(outcome.status, WorkflowResultStatus::Failed);
    assert_eq!(outcome.node("loop").unwrap().status, NodeStatus::Failed);
}

#[tokio::test]
async fn test_cancelled_debug_run_closes_stream_and_fails() {
    let h = Harness::with_model(Arc::new(SlowModel {
        delay: Duration::from_secs(30),
    }));
    let wf = h.workflows.create(ACCOUNT, meta("slow_answer")).await.unwrap();
    h.workflows
        .update_draft_graph(ACCOUNT, &wf.id, &llm_graph())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let mut run = h
        .workflows
        .debug(ACCOUNT, &wf.id, inputs(&[("q", json!("hi"))]), cancel.clone())
        .await
        .unwrap();

    // Wait until the slow node has started, then cancel.
    loop {
        let event = run.events.recv().await.expect("stream ended early");
        if event.node_id == "llm" && event.status == NodeStatus::Running {
            break;
        }
    }
    cancel.cancel();

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while run.events.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "event stream stayed open after cancel");

    let result = tokio::time::timeout(Duration::from_secs(5), run.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.status, WorkflowResultStatus::Failed);

    let stored = h.workflows.list_results(ACCOUNT, &wf.id).await.unwrap();
    assert_eq!(stored[0].status, WorkflowResultStatus::Failed);
    assert!(!h.workflows.get(ACCOUNT, &wf.id).await.unwrap().is_debug_passed);
}

#[tokio::test]
async fn test_lifecycle_debug_gates_publish() {
    let h = Harness::with_model(Arc::new(ScriptedModel::new("42")));
    let wf = h.workflows.create(ACCOUNT, meta("answer_bot")).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Draft);

    let dup = h.workflows.create(ACCOUNT, meta("answer_bot")).await.unwrap_err();
    assert_eq!(dup.kind(), ErrorKind::Conflict);
    let other = h.workflows.get("intruder", &wf.id).await.unwrap_err();
    assert_eq!(other.kind(), ErrorKind::Forbidden);

    h.workflows
        .update_draft_graph(ACCOUNT, &wf.id, &llm_graph())
        .await
        .unwrap();
    let early = h.workflows.publish(ACCOUNT, &wf.id).await.unwrap_err();
    assert_eq!(early.kind(), ErrorKind::Validation);

    let run = h
        .workflows
        .debug(
            ACCOUNT,
            &wf.id,
            inputs(&[("q", json!("meaning"))]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let result = finish(run).await;
    assert_eq!(result.status, WorkflowResultStatus::Succeeded);
    assert!(h.workflows.get(ACCOUNT, &wf.id).await.unwrap().is_debug_passed);

    let published = h.workflows.publish(ACCOUNT, &wf.id).await.unwrap();
    assert_eq!(published.status, WorkflowStatus::Published);
    assert_eq!(published.graph["nodes"].as_array().unwrap().len(), 3);
    assert!(published.published_at.is_some());

    // Editing the draft requires a fresh debug run.
    h.workflows
        .update_draft_graph(ACCOUNT, &wf.id, &llm_graph())
        .await
        .unwrap();
    assert!(!h.workflows.get(ACCOUNT, &wf.id).await.unwrap().is_debug_passed);

    let unpublished = h.workflows.cancel_publish(ACCOUNT, &wf.id).await.unwrap();
    assert_eq!(unpublished.status, WorkflowStatus::Draft);
    assert_eq!(unpublished.graph, json!({"nodes": [], "edges": []}));

    h.workflows.delete(ACCOUNT, &wf.id).await.unwrap();
    assert_eq!(
        h.workflows.get(ACCOUNT, &wf.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_cyclic_draft_is_rejected() {
    let h = Harness::new();
    let wf = h.workflows.create(ACCOUNT, meta("loopy")).await.unwrap();
    let raw = json!({
        "nodes": [
            {"id": "A", "title": "A", "node_type": "start"},
            {"id": "B", "title": "B", "node_type": "llm", "prompt": "hi"},
            {"id": "C", "title": "C", "node_type": "end"},
        ],
        "edges": [
            edge("e1", "A", "start", "B", "llm"),
            edge("e2", "B", "llm", "A", "start"),
        ]
    });
    let err = h
        .workflows
        .update_draft_graph(ACCOUNT, &wf.id, &raw)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("cycle"));
}

#[tokio::test]
async fn test_retrieval_node_reads_owned_datasets() {
    let h = Harness::new();
    let (_, two, text) = two_paragraphs();
    let (dataset_id, _) = h.ingest(&text, rule_1000()).await;

    let wf = h.workflows.create(ACCOUNT, meta("kb_lookup")).await.unwrap();
    let raw = json!({
        "nodes": [
            {"id": "start", "title": "Start", "node_type": "start",
             "inputs": [{"name": "query", "type": "string", "required": true}]},
            {"id": "kb", "title": "Knowledge", "node_type": "dataset_retrieval",
             "dataset_ids": [dataset_id, "not-mine"],
             "retrieval_config": {"retrieval_strategy": "semantic", "k": 1, "score": 0.0},
             "inputs": [{"name": "query", "type": "string", "value": reference("start", "query")}]},
            {"id": "end", "title": "End", "node_type": "end",
             "inputs": [{"name": "context", "type": "string",
                         "value": reference("kb", "combine_documents")}]},
        ],
        "edges": [
            edge("e1", "start", "start", "kb", "dataset_retrieval"),
            edge("e2", "kb", "dataset_retrieval", "end", "end"),
        ]
    });
    let saved = h
        .workflows
        .update_draft_graph(ACCOUNT, &wf.id, &raw)
        .await
        .unwrap();
    let kept = &saved.draft_graph["nodes"][1]["dataset_ids"];
    assert_eq!(kept, &json!([dataset_id]));

    let run = h
        .workflows
        .debug(
            ACCOUNT,
            &wf.id,
            inputs(&[("query", json!("paragraph two"))]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let result = finish(run).await;
    assert_eq!(result.status, WorkflowResultStatus::Succeeded);
    let end = result.state.as_array().unwrap().last().unwrap().clone();
    assert_eq!(end["outputs"]["context"], json!(two));
}

#[tokio::test]
async fn test_standalone_graph_drops_other_accounts_datasets() {
    let h = Harness::new();
    let (_, two, text) = two_paragraphs();
    let (mine, _) = h.ingest(&text, rule_1000()).await;
    let theirs = h
        .indexing
        .create_dataset("acct-2", "private", "")
        .await
        .unwrap();

    let raw = json!({
        "nodes": [
            {"id": "start", "title": "Start", "node_type": "start",
             "inputs": [{"name": "query", "type": "string", "required": true}]},
            {"id": "kb", "title": "Knowledge", "node_type": "dataset_retrieval",
             "dataset_ids": [theirs.id, mine],
             "retrieval_config": {"retrieval_strategy": "semantic", "k": 1, "score": 0.0},
             "inputs": [{"name": "query", "type": "string", "value": reference("start", "query")}]},
            {"id": "end", "title": "End", "node_type": "end",
             "inputs": [{"name": "context", "type": "string",
                         "value": reference("kb", "combine_documents")}]},
        ],
        "edges": [
            edge("e1", "start", "start", "kb", "dataset_retrieval"),
            edge("e2", "kb", "dataset_retrieval", "end", "end"),
        ]
    });
    let graph = h.workflows.normalize(ACCOUNT, None, &raw).await.unwrap();
    assert_eq!(graph.to_value()["nodes"][1]["dataset_ids"], json!([mine]));

    let outcome = h
        .executor
        .run(
            ACCOUNT,
            &graph,
            inputs(&[("query", json!("paragraph two"))]),
            CancellationToken::new(),
            None,
        )
        .await;
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.outputs["context"], json!(two));

    let other = h.workflows.normalize("acct-2", None, &raw).await.unwrap();
    assert_eq!(other.to_value()["nodes"][1]["dataset_ids"], json!([theirs.id]));
}
