//! Workflow graph entities.
//!
//! The persisted graph blob is `{ "nodes": [...], "edges": [...] }`. A node
//! carries its kind in `node_type` with the kind-specific payload inline:
//!
//! ```json
//! { "id": "n2", "node_type": "llm", "title": "Answer",
//!   "prompt": "Reply to {{query}}",
//!   "inputs":  [{ "name": "query", "type": "string",
//!                 "value": { "type": "ref", "ref_node_id": "n1", "ref_var_name": "query" } }],
//!   "outputs": [] }
//! ```
//!
//! Nodes never point at each other; edges carry node IDs and the graph
//! index keeps forward and reverse adjacency keyed by ID.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::search::RetrievalStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Llm,
    Tool,
    Code,
    DatasetRetrieval,
    HttpRequest,
    TemplateTransform,
    QuestionClassifier,
    Iteration,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Llm => "llm",
            NodeType::Tool => "tool",
            NodeType::Code => "code",
            NodeType::DatasetRetrieval => "dataset_retrieval",
            NodeType::HttpRequest => "http_request",
            NodeType::TemplateTransform => "template_transform",
            NodeType::QuestionClassifier => "question_classifier",
            NodeType::Iteration => "iteration",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    #[default]
    String,
    Int,
    Float,
    Boolean,
    ArrayString,
    ArrayInt,
    ArrayFloat,
    ArrayBoolean,
    Object,
}

impl VariableType {
    /// Value used when an optional reference cannot be resolved.
    pub fn zero_value(&self) -> Value {
        match self {
            VariableType::String => Value::String(String::new()),
            VariableType::Int => Value::from(0),
            VariableType::Float => Value::from(0.0),
            VariableType::Boolean => Value::Bool(false),
            VariableType::ArrayString
            | VariableType::ArrayInt
            | VariableType::ArrayFloat
            | VariableType::ArrayBoolean => Value::Array(Vec::new()),
            VariableType::Object => Value::Object(Map::new()),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            VariableType::ArrayString
                | VariableType::ArrayInt
                | VariableType::ArrayFloat
                | VariableType::ArrayBoolean
        )
    }

    /// Element type of an array type.
    pub fn element(&self) -> Option<VariableType> {
        match self {
            VariableType::ArrayString => Some(VariableType::String),
            VariableType::ArrayInt => Some(VariableType::Int),
            VariableType::ArrayFloat => Some(VariableType::Float),
            VariableType::ArrayBoolean => Some(VariableType::Boolean),
            _ => None,
        }
    }
}

/// Where a variable's value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VariableValue {
    Constant {
        #[serde(default)]
        content: Value,
    },
    Ref {
        ref_node_id: String,
        ref_var_name: String,
    },
    /// Produced by the node itself (outputs, workflow parameters).
    Generated {
        #[serde(default)]
        content: Value,
    },
}

impl Default for VariableValue {
    fn default() -> Self {
        VariableValue::Generated {
            content: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default)]
    pub value: VariableValue,
    /// Free-form annotations; the HTTP node reads `meta.type`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

impl Variable {
    pub fn new(name: &str, var_type: VariableType) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            required: false,
            var_type,
            value: VariableValue::default(),
            meta: Map::new(),
        }
    }

    pub fn meta_type(&self) -> Option<&str> {
        self.meta.get("type").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LlmModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub retrieval_strategy: RetrievalStrategy,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub score: f64,
}

fn default_k() -> usize {
    4
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            retrieval_strategy: RetrievalStrategy::default(),
            k: default_k(),
            score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// One branch of a question classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassConfig {
    /// Class description shown to the model.
    pub query: String,
    pub source_handle_id: String,
}

/// Kind-specific node payload, tagged by `node_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum NodeData {
    Start {},
    End {},
    Llm {
        prompt: String,
        #[serde(default)]
        model_config: LlmModelConfig,
    },
    Tool {
        tool_name: String,
        /// Static arguments merged under the resolved inputs.
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        params: Map<String, Value>,
    },
    Code {
        #[serde(default = "default_code_language")]
        language: String,
        code: String,
    },
    DatasetRetrieval {
        dataset_ids: Vec<String>,
        #[serde(default)]
        retrieval_config: RetrievalConfig,
    },
    HttpRequest {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    TemplateTransform {
        template: String,
    },
    QuestionClassifier {
        #[serde(default)]
        classes: Vec<ClassConfig>,
    },
    Iteration {
        #[serde(default)]
        workflow_ids: Vec<String>,
    },
}

fn default_code_language() -> String {
    "lua".to_string()
}

impl NodeData {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeData::Start {} => NodeType::Start,
            NodeData::End {} => NodeType::End,
            NodeData::Llm { .. } => NodeType::Llm,
            NodeData::Tool { .. } => NodeType::Tool,
            NodeData::Code { .. } => NodeType::Code,
            NodeData::DatasetRetrieval { .. } => NodeType::DatasetRetrieval,
            NodeData::HttpRequest { .. } => NodeType::HttpRequest,
            NodeData::TemplateTransform { .. } => NodeType::TemplateTransform,
            NodeData::QuestionClassifier { .. } => NodeType::QuestionClassifier,
            NodeData::Iteration { .. } => NodeType::Iteration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub inputs: Vec<Variable>,
    #[serde(default)]
    pub outputs: Vec<Variable>,
    #[serde(flatten)]
    pub data: NodeData,
}

/// Output name used by kinds that emit a single value.
pub const DEFAULT_OUTPUT: &str = "output";
pub const RETRIEVAL_OUTPUT: &str = "combine_documents";
pub const ITERATION_OUTPUT: &str = "outputs";

impl Node {
    pub fn node_type(&self) -> NodeType {
        self.data.node_type()
    }

    /// The first declared output's name, or `fallback`.
    pub fn primary_output(&self, fallback: &str) -> String {
        self.outputs
            .first()
            .map(|v| v.name.clone())
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Output names downstream nodes may reference: declared outputs plus
    /// the values every node of this kind produces.
    pub fn output_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.outputs.iter().map(|v| v.name.clone()).collect();
        let intrinsic: Vec<String> = match self.node_type() {
            NodeType::Llm => vec!["response".into(), "prompt_used".into(), "model".into()],
            NodeType::HttpRequest => vec!["text".into(), "status_code".into()],
            NodeType::TemplateTransform | NodeType::Tool => {
                vec![self.primary_output(DEFAULT_OUTPUT)]
            }
            NodeType::DatasetRetrieval => vec![self.primary_output(RETRIEVAL_OUTPUT)],
            NodeType::Iteration => vec![self.primary_output(ITERATION_OUTPUT)],
            _ => Vec::new(),
        };
        for name in intrinsic {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    pub fn input(&self, name: &str) -> Option<&Variable> {
        self.inputs.iter().find(|v| v.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub source_type: NodeType,
    pub target: String,
    pub target_type: NodeType,
    /// Set only on edges leaving a question classifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle_id: Option<String>,
}

/// A parsed (and, after validation, normalized) workflow graph.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_type() == NodeType::Start)
    }

    pub fn end(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_type() == NodeType::End)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_parses_inline_payload() {
        let raw = json!({
            "id": "n1",
            "title": "Answer",
            "node_type": "llm",
            "prompt": "Reply to {{query}}",
            "inputs": [{
                "name": "query",
                "type": "string",
                "value": {"type": "ref", "ref_node_id": "start", "ref_var_name": "query"}
            }]
        });
        let node: Node = serde_json::from_value(raw).unwrap();
        assert_eq!(node.node_type(), NodeType::Llm);
        assert!(matches!(
            &node.inputs[0].value,
            VariableValue::Ref { ref_node_id, .. } if ref_node_id == "start"
        ));
        assert!(node.output_names().contains(&"response".to_string()));
    }

    #[test]
    fn test_unknown_node_type_rejected() {
        let raw = json!({"id": "n1", "title": "x", "node_type": "teleport"});
        assert!(serde_json::from_value::<Node>(raw).is_err());
    }

    #[test]
    fn test_node_serializes_back_to_same_shape() {
        let raw = json!({
            "id": "t",
            "title": "T",
            "node_type": "template_transform",
            "template": "{{a}}"
        });
        let node: Node = serde_json::from_value(raw).unwrap();
        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["node_type"], "template_transform");
        assert_eq!(back["template"], "{{a}}");
        let again: Node = serde_json::from_value(back).unwrap();
        assert_eq!(again, node);
    }

    #[test]
    fn test_zero_values() {
        assert_eq!(VariableType::String.zero_value(), json!(""));
        assert_eq!(VariableType::Int.zero_value(), json!(0));
        assert_eq!(VariableType::Boolean.zero_value(), json!(false));
        assert_eq!(VariableType::ArrayString.zero_value(), json!([]));
        assert_eq!(VariableType::Object.zero_value(), json!({}));
    }
}
