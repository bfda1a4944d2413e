//! Per-kind node behaviour.
//!
//! | Kind | Outputs |
//! |------|---------|
//! | start / end | their resolved inputs |
//! | llm | `response`, `prompt_used`, `model` (+ first declared output) |
//! | template_transform | first declared output, default `output` |
//! | dataset_retrieval | first declared output, default `combine_documents` |
//! | code | declared outputs, zero-filled |
//! | tool | first declared output, default `output` |
//! | http_request | `text`, `status_code` |
//! | question_classifier | `source_handle_id`, `class`; routes one branch |
//! | iteration | first declared output, default `outputs`: JSON string per element |

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use llmops_core::llm::CompletionParams;
use llmops_core::models::{QuerySource, WorkflowStatus};
use llmops_core::store::WorkflowStore;
use llmops_core::tool::CodeRequest;
use llmops_core::workflow::entities::{
    ClassConfig, HttpMethod, LlmModelConfig, RetrievalConfig, DEFAULT_OUTPUT, ITERATION_OUTPUT,
    RETRIEVAL_OUTPUT,
};
use llmops_core::workflow::template::{render, value_to_text};
use llmops_core::workflow::{validate_graph, Graph, Node, NodeData, ValidationContext};
use llmops_core::{Error, ErrorKind, Result};

use super::executor::{fold_error, Branch, Executed, RunContext, WorkflowExecutor};
use crate::retrieval::SearchRequest;

/// Deepest allowed chain of iteration nodes calling sub-workflows.
pub const MAX_ITERATION_DEPTH: usize = 5;

fn single(name: String, value: Value) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert(name, value);
    out
}

/// Node timeout, or the configured default, bounded to `1..=max` seconds.
fn http_timeout_secs(requested: Option<u64>, default: u64, max: u64) -> u64 {
    requested.unwrap_or(default).clamp(1, max.max(1))
}

fn text_input(inputs: &Map<String, Value>, name: &str) -> String {
    inputs.get(name).map(value_to_text).unwrap_or_default()
}

impl WorkflowExecutor {
    pub(super) async fn execute(
        &self,
        node: &Node,
        inputs: Map<String, Value>,
        ctx: &RunContext,
    ) -> Result<Executed> {
        match &node.data {
            NodeData::Start {} | NodeData::End {} => Ok(Executed::outputs(inputs)),
            NodeData::Llm {
                prompt,
                model_config,
            } => self.llm_node(node, prompt, model_config, &inputs).await,
            NodeData::TemplateTransform { template } => Ok(Executed::outputs(single(
                node.primary_output(DEFAULT_OUTPUT),
                Value::String(render(template, &inputs)),
            ))),
            NodeData::DatasetRetrieval {
                dataset_ids,
                retrieval_config,
            } => {
                self.retrieval_node(node, dataset_ids, retrieval_config, &inputs, ctx)
                    .await
            }
            NodeData::Code { language, code } => {
                self.code_node(node, language, code, inputs).await
            }
            NodeData::Tool { tool_name, params } => {
                self.tool_node(node, tool_name, params, inputs).await
            }
            NodeData::HttpRequest {
                url,
                method,
                timeout_secs,
            } => {
                self.http_node(node, url, *method, *timeout_secs, &inputs)
                    .await
            }
            NodeData::QuestionClassifier { classes } => self.classify(classes, &inputs).await,
            NodeData::Iteration { workflow_ids } => {
                self.iterate(node, workflow_ids, &inputs, ctx).await
            }
        }
    }

    async fn llm_node(
        &self,
        node: &Node,
        prompt: &str,
        model_config: &LlmModelConfig,
        inputs: &Map<String, Value>,
    ) -> Result<Executed> {
        let rendered = render(prompt, inputs);
        let params = CompletionParams {
            temperature: model_config.temperature,
            max_tokens: model_config.max_tokens,
        };
        let response = self.llm.complete(&rendered, &params).await?;
        let model = model_config
            .model
            .clone()
            .unwrap_or_else(|| self.llm.model_name().to_string());

        let mut out = Map::new();
        if let Some(declared) = node.outputs.first() {
            out.insert(declared.name.clone(), Value::String(response.clone()));
        }
        out.insert("response".into(), Value::String(response));
        out.insert("prompt_used".into(), Value::String(rendered));
        out.insert("model".into(), Value::String(model));
        Ok(Executed::outputs(out))
    }

    async fn retrieval_node(
        &self,
        node: &Node,
        dataset_ids: &[String],
        config: &RetrievalConfig,
        inputs: &Map<String, Value>,
        ctx: &RunContext,
    ) -> Result<Executed> {
        let name = node.primary_output(RETRIEVAL_OUTPUT);
        if dataset_ids.is_empty() {
            return Ok(Executed::outputs(single(name, Value::String(String::new()))));
        }
        let request = SearchRequest::new(
            &ctx.account_id,
            dataset_ids.to_vec(),
            &text_input(inputs, "query"),
        )
        .strategy(config.retrieval_strategy)
        .k(config.k.max(1))
        .score(config.score)
        .source(QuerySource::Workflow, None);
        let docs = self.retrieval.search(&request).await?;
        let combined = docs
            .iter()
            .map(|d| d.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(Executed::outputs(single(name, Value::String(combined))))
    }

    async fn code_node(
        &self,
        node: &Node,
        language: &str,
        code: &str,
        inputs: Map<String, Value>,
    ) -> Result<Executed> {
        let request = CodeRequest {
            language: language.to_string(),
            code: code.to_string(),
            inputs,
            env: HashMap::new(),
            timeout: Duration::from_secs(self.settings.code_timeout_secs),
        };
        let result = self.code.run(request).await.map_err(fold_error)?;
        if node.outputs.is_empty() {
            return Ok(Executed::outputs(result));
        }
        let outputs = node
            .outputs
            .iter()
            .map(|v| {
                let value = result
                    .get(&v.name)
                    .cloned()
                    .unwrap_or_else(|| v.var_type.zero_value());
                (v.name.clone(), value)
            })
            .collect();
        Ok(Executed::outputs(outputs))
    }

    async fn tool_node(
        &self,
        node: &Node,
        tool_name: &str,
        params: &Map<String, Value>,
        inputs: Map<String, Value>,
    ) -> Result<Executed> {
        let mut args = params.clone();
        args.extend(inputs);
        let args_json = serde_json::to_string(&Value::Object(args))?;
        let out = self
            .tools
            .invoke(tool_name, &args_json)
            .await
            .map_err(fold_error)?;
        Ok(Executed::outputs(single(
            node.primary_output(DEFAULT_OUTPUT),
            Value::String(out),
        )))
    }

    async fn http_node(
        &self,
        node: &Node,
        url: &str,
        method: HttpMethod,
        timeout_secs: Option<u64>,
        inputs: &Map<String, Value>,
    ) -> Result<Executed> {
        let mut target = url::Url::parse(url)
            .map_err(|e| Error::validation(format!("invalid url {:?}: {}", url, e)))?;

        let mut params: Vec<(String, String)> = Vec::new();
        let mut headers = HeaderMap::new();
        let mut body = Map::new();
        for var in &node.inputs {
            let value = inputs.get(&var.name).cloned().unwrap_or(Value::Null);
            match var.meta_type() {
                Some("header") | Some("headers") => {
                    let name = HeaderName::from_bytes(var.name.as_bytes()).map_err(|e| {
                        Error::validation(format!("invalid header name {:?}: {}", var.name, e))
                    })?;
                    let text = value_to_text(&value);
                    let value = HeaderValue::from_str(&text).map_err(|e| {
                        Error::validation(format!("invalid header value for {}: {}", var.name, e))
                    })?;
                    headers.insert(name, value);
                }
                Some("body") => {
                    body.insert(var.name.clone(), value);
                }
                _ => params.push((var.name.clone(), value_to_text(&value))),
            }
        }
        if !params.is_empty() {
            target.query_pairs_mut().extend_pairs(params.iter());
        }

        let http_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| Error::validation(format!("invalid method: {}", e)))?;
        let secs = http_timeout_secs(
            timeout_secs,
            self.settings.http_timeout_secs,
            self.settings.max_http_timeout_secs,
        );

        let mut request = self
            .http
            .request(http_method, target.clone())
            .timeout(Duration::from_secs(secs));
        if method != HttpMethod::Get && !body.is_empty() {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            request = request.body(serde_json::to_vec(&Value::Object(body))?);
        }
        let response = request
            .headers(headers)
            .send()
            .await
            .map_err(|e| Error::transient(format!("{} {} failed: {}", method.as_str(), target, e)))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| Error::transient(format!("reading response from {}: {}", target, e)))?;
        debug!(url = %target, status, "http node finished");

        let mut out = Map::new();
        out.insert("text".into(), Value::String(text));
        out.insert("status_code".into(), Value::from(status));
        Ok(Executed::outputs(out))
    }

    async fn classify(
        &self,
        classes: &[ClassConfig],
        inputs: &Map<String, Value>,
    ) -> Result<Executed> {
        let Some(first) = classes.first() else {
            return Ok(Executed {
                outputs: Map::new(),
                branch: Branch::Closed,
            });
        };
        let query = text_input(inputs, "query");
        let params = CompletionParams {
            temperature: Some(0.0),
            max_tokens: Some(64),
        };
        let reply = match self
            .llm
            .complete(&classifier_prompt(classes, &query), &params)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "classifier model call failed, using first class");
                String::new()
            }
        };
        let chosen = pick_class(classes, &reply).unwrap_or(first);

        let mut out = Map::new();
        out.insert(
            "source_handle_id".into(),
            Value::String(chosen.source_handle_id.clone()),
        );
        out.insert("class".into(), Value::String(chosen.query.clone()));
        Ok(Executed {
            outputs: out,
            branch: Branch::Handle(chosen.source_handle_id.clone()),
        })
    }

    async fn iterate(
        &self,
        node: &Node,
        workflow_ids: &[String],
        inputs: &Map<String, Value>,
        ctx: &RunContext,
    ) -> Result<Executed> {
        if ctx.depth >= MAX_ITERATION_DEPTH {
            return Err(Error::validation(format!(
                "iteration nested deeper than {} levels",
                MAX_ITERATION_DEPTH
            )));
        }
        let workflow_id = workflow_ids
            .first()
            .ok_or_else(|| Error::validation("iteration node has no workflow"))?;
        let graph = self.load_sub_workflow(workflow_id, &ctx.account_id).await?;

        let items = match inputs.get("inputs") {
            Some(Value::Array(items)) => items.clone(),
            None | Some(Value::Null) => Vec::new(),
            Some(other) => {
                return Err(Error::validation(format!(
                    "iteration input must be an array, got {}",
                    other
                )))
            }
        };
        let bind = graph
            .start()
            .and_then(|s| s.inputs.first())
            .map(|v| v.name.clone());

        let sub_ctx = RunContext {
            account_id: ctx.account_id.clone(),
            cancel: ctx.cancel.clone(),
            events: None,
            depth: ctx.depth + 1,
        };
        let mut outputs = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let mut sub_inputs = Map::new();
            if let Some(name) = &bind {
                sub_inputs.insert(name.clone(), item);
            }
            let outcome = self.run_graph(&graph, sub_inputs, &sub_ctx).await;
            if outcome.error_kind == Some(ErrorKind::Cancelled) {
                return Err(Error::Cancelled);
            }
            if outcome.succeeded() {
                outputs.push(Value::String(serde_json::to_string(&Value::Object(
                    outcome.outputs,
                ))?));
            } else {
                warn!(
                    workflow_id = %workflow_id,
                    index,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "iteration element failed, dropping it"
                );
            }
        }
        Ok(Executed::outputs(single(
            node.primary_output(ITERATION_OUTPUT),
            Value::Array(outputs),
        )))
    }

    async fn load_sub_workflow(&self, workflow_id: &str, account_id: &str) -> Result<Graph> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("workflow {}", workflow_id)))?;
        if workflow.account_id != account_id {
            return Err(Error::Forbidden(format!(
                "workflow {} belongs to another account",
                workflow_id
            )));
        }
        if workflow.status != WorkflowStatus::Published {
            return Err(Error::validation(format!(
                "workflow {} is not published",
                workflow_id
            )));
        }
        let ctx = ValidationContext {
            workflow_id: Some(workflow.id.clone()),
            accessible_dataset_ids: None,
        };
        validate_graph(&workflow.graph, &ctx)
    }
}

fn classifier_prompt(classes: &[ClassConfig], query: &str) -> String {
    let mut prompt = String::from(
        "Classify the question into exactly one of the classes below.\n\
         Reply with the class id only.\n\nClasses:\n",
    );
    for class in classes {
        prompt.push_str(&format!("- {}: {}\n", class.source_handle_id, class.query));
    }
    prompt.push_str(&format!("\nQuestion: {}\n", query));
    prompt
}

/// Exact handle match first, then the first handle mentioned in the reply.
fn pick_class<'c>(classes: &'c [ClassConfig], reply: &str) -> Option<&'c ClassConfig> {
    let reply = reply
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim();
    if reply.is_empty() {
        return None;
    }
    classes
        .iter()
        .find(|c| c.source_handle_id == reply)
        .or_else(|| {
            classes
                .iter()
                .find(|c| reply.contains(c.source_handle_id.as_str()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes() -> Vec<ClassConfig> {
        vec![
            ClassConfig {
                query: "billing questions".into(),
                source_handle_id: "billing".into(),
            },
            ClassConfig {
                query: "anything else".into(),
                source_handle_id: "other".into(),
            },
        ]
    }

    #[test]
    fn test_pick_class_exact_and_contained() {
        let classes = classes();
        assert_eq!(pick_class(&classes, "other").unwrap().source_handle_id, "other");
        assert_eq!(pick_class(&classes, " \"billing\" ").unwrap().source_handle_id, "billing");
        assert_eq!(
            pick_class(&classes, "The answer is other.").unwrap().source_handle_id,
            "other"
        );
        assert!(pick_class(&classes, "unknown").is_none());
        assert!(pick_class(&classes, "").is_none());
    }

    #[test]
    fn test_http_timeout_is_bounded() {
        assert_eq!(http_timeout_secs(None, 30, 300), 30);
        assert_eq!(http_timeout_secs(Some(0), 30, 300), 1);
        assert_eq!(http_timeout_secs(Some(900), 30, 300), 300);
        assert_eq!(http_timeout_secs(None, 600, 300), 300);
        assert_eq!(http_timeout_secs(Some(5), 30, 0), 1);
    }

    #[test]
    fn test_classifier_prompt_lists_handles_and_question() {
        let prompt = classifier_prompt(&classes(), "where is my invoice");
        assert!(prompt.contains("- billing: billing questions"));
        assert!(prompt.contains("- other: anything else"));
        assert!(prompt.contains("Question: where is my invoice"));
    }
}
