//! Executor runs of the http, code and tool nodes against local collaborators.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use common::*;
use llmops::config::WorkflowConfig;
use llmops::lua_runtime::LuaCodeRunner;
use llmops::tools::ToolRegistry;
use llmops::workflow::WorkflowExecutor;
use llmops_core::llm::ScriptedModel;
use llmops_core::tool::ToolManager;
use llmops_core::workflow::{validate_graph, Graph, ValidationContext};
use llmops_core::ErrorKind;

fn validated(raw: &Value) -> Graph {
    validate_graph(raw, &ValidationContext::default()).unwrap()
}

fn executor(h: &Harness, tools: Arc<dyn ToolManager>, settings: WorkflowConfig) -> WorkflowExecutor {
    WorkflowExecutor::new(
        Arc::new(ScriptedModel::new("ok")),
        h.retrieval.clone(),
        tools,
        Arc::new(LuaCodeRunner::new()),
        h.store.clone(),
        settings,
    )
}

/// start ─▶ `node` ─▶ end, with `ends` wired from the node's outputs.
fn through(start_inputs: Value, node: Value, ends: &[(&str, &str)]) -> Value {
    let kind = node["node_type"].as_str().unwrap().to_string();
    let end_inputs: Vec<Value> = ends
        .iter()
        .map(|(name, output)| json!({"name": name, "type": "string", "value": reference("n", output)}))
        .collect();
    json!({
        "nodes": [
            {"id": "start", "title": "Start", "node_type": "start", "inputs": start_inputs},
            node,
            {"id": "end", "title": "End", "node_type": "end", "inputs": end_inputs},
        ],
        "edges": [
            edge("e1", "start", "start", "n", &kind),
            edge("e2", "n", &kind, "end", "end"),
        ]
    })
}

// ═══════════════════════════════════════════════════════════════
// http_request
// ═══════════════════════════════════════════════════════════════

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: String) -> (StatusCode, Json<Value>) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    (
        StatusCode::CREATED,
        Json(json!({
            "method": method.as_str(),
            "query": uri.query().unwrap_or_default(),
            "content_type": header("content-type"),
            "trace": header("x_trace"),
            "body": body,
        })),
    )
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "late"
}

/// Serve the echo and slow routes on an ephemeral port.
async fn serve() -> String {
    let app = Router::new()
        .route("/echo", any(echo))
        .route("/slow", any(slow));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn http_graph(url: &str, method: &str, timeout_secs: Option<u64>) -> Value {
    let mut node = json!({
        "id": "n", "title": "Call", "node_type": "http_request",
        "url": url, "method": method,
        "inputs": [
            {"name": "q", "type": "string", "value": reference("start", "q"),
             "meta": {"type": "params"}},
            {"name": "x_trace", "type": "string", "value": reference("start", "trace"),
             "meta": {"type": "headers"}},
            {"name": "name", "type": "string", "value": reference("start", "name"),
             "meta": {"type": "body"}},
        ]
    });
    if let Some(secs) = timeout_secs {
        node["timeout_secs"] = json!(secs);
    }
    through(
        json!([
            {"name": "q", "type": "string", "required": true},
            {"name": "trace", "type": "string", "required": true},
            {"name": "name", "type": "string", "required": true},
        ]),
        node,
        &[("text", "text"), ("status", "status_code")],
    )
}

fn http_inputs() -> serde_json::Map<String, Value> {
    inputs(&[
        ("q", json!("rust lang")),
        ("trace", json!("abc-123")),
        ("name", json!("ada")),
    ])
}

#[tokio::test]
async fn test_http_node_splits_inputs_by_meta_type() {
    let base = serve().await;
    let h = Harness::new();
    let graph = validated(&http_graph(&format!("{}/echo", base), "post", None));

    let outcome = h
        .executor
        .run(ACCOUNT, &graph, http_inputs(), CancellationToken::new(), None)
        .await;
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.outputs["status"], json!(201));

    let echoed: Value = serde_json::from_str(outcome.outputs["text"].as_str().unwrap()).unwrap();
    assert_eq!(echoed["method"], json!("POST"));
    assert_eq!(echoed["query"], json!("q=rust+lang"));
    assert_eq!(echoed["trace"], json!("abc-123"));
    assert_eq!(echoed["content_type"], json!("application/json"));
    let body: Value = serde_json::from_str(echoed["body"].as_str().unwrap()).unwrap();
    assert_eq!(body, json!({"name": "ada"}));
}

#[tokio::test]
async fn test_http_get_sends_no_body() {
    let base = serve().await;
    let h = Harness::new();
    let graph = validated(&http_graph(&format!("{}/echo", base), "get", None));

    let outcome = h
        .executor
        .run(ACCOUNT, &graph, http_inputs(), CancellationToken::new(), None)
        .await;
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    let echoed: Value = serde_json::from_str(outcome.outputs["text"].as_str().unwrap()).unwrap();
    assert_eq!(echoed["method"], json!("GET"));
    assert_eq!(echoed["body"], json!(""));
    assert_eq!(echoed["content_type"], json!(""));
}

#[tokio::test]
async fn test_http_node_timeout_is_capped_by_config() {
    let base = serve().await;
    let h = Harness::new();
    let settings = WorkflowConfig {
        max_http_timeout_secs: 1,
        ..WorkflowConfig::default()
    };
    let executor = executor(&h, Arc::new(ToolRegistry::with_builtins()), settings);
    let graph = validated(&http_graph(&format!("{}/slow", base), "get", Some(600)));

    let started = std::time::Instant::now();
    let outcome = executor
        .run(ACCOUNT, &graph, http_inputs(), CancellationToken::new(), None)
        .await;
    assert!(!outcome.succeeded());
    assert_eq!(outcome.error_kind, Some(ErrorKind::Transient));
    assert!(started.elapsed() < Duration::from_secs(4));
}

// ═══════════════════════════════════════════════════════════════
// code
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_code_node_zero_fills_missing_outputs() {
    let h = Harness::new();
    let node = json!({
        "id": "n", "title": "Script", "node_type": "code",
        "code": "function main(inputs) return { doubled = inputs.n * 2, ignored = true } end",
        "inputs": [{"name": "n", "type": "int", "value": reference("start", "n")}],
        "outputs": [
            {"name": "doubled", "type": "int"},
            {"name": "label", "type": "string"},
            {"name": "tags", "type": "array_string"},
            {"name": "ok", "type": "boolean"},
        ]
    });
    let graph = validated(&through(
        json!([{"name": "n", "type": "int", "required": true}]),
        node,
        &[("doubled", "doubled"), ("label", "label"), ("tags", "tags"), ("ok", "ok")],
    ));

    let outcome = h
        .executor
        .run(ACCOUNT, &graph, inputs(&[("n", json!(21))]), CancellationToken::new(), None)
        .await;
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    let code = outcome
        .node_results
        .iter()
        .find(|r| r.node_id == "n")
        .unwrap();
    assert_eq!(
        Value::Object(code.outputs.clone()),
        json!({"doubled": 42, "label": "", "tags": [], "ok": false})
    );
}

// ═══════════════════════════════════════════════════════════════
// tool
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct RecordingTools {
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ToolManager for RecordingTools {
    async fn invoke(&self, name: &str, args_json: &str) -> anyhow::Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), args_json.to_string()));
        Ok("sunny".to_string())
    }
}

#[tokio::test]
async fn test_tool_node_merges_params_under_inputs() {
    let h = Harness::new();
    let tools = Arc::new(RecordingTools::default());
    let executor = executor(&h, tools.clone(), WorkflowConfig::default());
    let node = json!({
        "id": "n", "title": "Weather", "node_type": "tool",
        "tool_name": "weather",
        "params": {"units": "metric", "city": "placeholder"},
        "inputs": [{"name": "city", "type": "string", "value": reference("start", "city")}],
        "outputs": [{"name": "report", "type": "string"}]
    });
    let graph = validated(&through(
        json!([{"name": "city", "type": "string", "required": true}]),
        node,
        &[("report", "report")],
    ));

    let outcome = executor
        .run(ACCOUNT, &graph, inputs(&[("city", json!("Oslo"))]), CancellationToken::new(), None)
        .await;
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.outputs["report"], json!("sunny"));

    let calls = tools.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "weather");
    let args: Value = serde_json::from_str(&calls[0].1).unwrap();
    assert_eq!(args, json!({"units": "metric", "city": "Oslo"}));
}

#[tokio::test]
async fn test_tool_node_defaults_output_name() {
    let h = Harness::new();
    let node = json!({
        "id": "n", "title": "Clock", "node_type": "tool",
        "tool_name": "current_time",
        "params": {"format": "%Y"}
    });
    let graph = validated(&through(json!([]), node, &[("year", "output")]));

    let outcome = h
        .executor
        .run(ACCOUNT, &graph, inputs(&[]), CancellationToken::new(), None)
        .await;
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.outputs["year"].as_str().unwrap().len(), 4);
}
