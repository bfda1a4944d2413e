//! Workflow graph validation and normalization.
//!
//! [`validate_graph`] takes the raw `{nodes, edges}` payload and returns a
//! normalized [`Graph`] or a [`Error::Validation`] describing the first
//! rule that failed. Rules run in this order:
//!
//! | # | Rule |
//! |---|------|
//! | 1 | workflow name and description ([`validate_workflow_meta`]) |
//! | 2 | nodes and edges non-empty |
//! | 3 | every node parses for its `node_type`; variable names are identifiers |
//! | 4 | node IDs unique; trimmed titles unique |
//! | 5 | exactly one start and one end |
//! | 6 | edges parse; IDs unique; endpoints exist with matching types |
//! | 7 | no duplicate `(source, target, source_handle_id)` |
//! | 8 | adjacency maps |
//! | 9 | the start is the only source and the end the only sink |
//! | 10 | every node reachable from the start |
//! | 11 | acyclic |
//! | 12 | refs point at an ancestor's output |
//! | 13 | per-kind checks |
//!
//! Normalization: the start node's outputs mirror its inputs, the end
//! node's outputs are cleared, retrieval nodes keep only accessible
//! dataset IDs, and an iteration node never references the workflow
//! being validated. Running the validator on its own output is a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::entities::{Edge, Graph, Node, NodeData, NodeType, Variable, VariableType, VariableValue};
use super::graph::GraphIndex;
use crate::error::{Error, Result};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("static regex"));

pub const MAX_DESCRIPTION_CHARS: usize = 1024;

/// Caller-specific inputs to normalization.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// ID of the workflow being validated, removed from iteration nodes.
    pub workflow_id: Option<String>,
    /// Datasets the caller owns. `None` keeps retrieval nodes untouched.
    pub accessible_dataset_ids: Option<HashSet<String>>,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Validation(msg.into())
}

pub fn is_identifier(s: &str) -> bool {
    IDENTIFIER.is_match(s)
}

/// Rule 1: the tool-call name is an identifier, the display name is
/// non-empty and the description fits.
pub fn validate_workflow_meta(tool_call_name: &str, name: &str, description: &str) -> Result<()> {
    if !is_identifier(tool_call_name) {
        return Err(invalid(format!(
            "tool_call_name {:?} must match ^[a-zA-Z_][a-zA-Z0-9_]*$",
            tool_call_name
        )));
    }
    if name.trim().is_empty() {
        return Err(invalid("workflow name must not be empty"));
    }
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(invalid(format!(
            "description exceeds {} characters",
            MAX_DESCRIPTION_CHARS
        )));
    }
    Ok(())
}

/// Dataset IDs mentioned by retrieval nodes in a raw graph, without
/// validating anything else. Used to look up ownership before validation.
pub fn referenced_dataset_ids(raw: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let nodes = raw.get("nodes").and_then(Value::as_array);
    for node in nodes.into_iter().flatten() {
        if node.get("node_type").and_then(Value::as_str) != Some("dataset_retrieval") {
            continue;
        }
        let ids = node.get("dataset_ids").and_then(Value::as_array);
        for id in ids.into_iter().flatten().filter_map(Value::as_str) {
            if !out.iter().any(|o| o == id) {
                out.push(id.to_string());
            }
        }
    }
    out
}

/// Validate and normalize a raw graph payload.
pub fn validate_graph(raw: &Value, ctx: &ValidationContext) -> Result<Graph> {
    // Rule 2
    let raw_nodes = raw
        .get("nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let raw_edges = raw
        .get("edges")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if raw_nodes.is_empty() {
        return Err(invalid("workflow graph has no nodes"));
    }
    if raw_edges.is_empty() {
        return Err(invalid("workflow graph has no edges"));
    }

    // Rule 3
    let mut nodes = Vec::with_capacity(raw_nodes.len());
    for (i, raw_node) in raw_nodes.into_iter().enumerate() {
        let node: Node = serde_json::from_value(raw_node)
            .map_err(|e| invalid(format!("node #{} is malformed: {}", i, e)))?;
        check_node_shape(&node)?;
        nodes.push(node);
    }

    // Rule 4
    let mut ids = HashSet::new();
    let mut titles = HashSet::new();
    for node in &nodes {
        if !ids.insert(node.id.clone()) {
            return Err(invalid(format!("duplicate node id {}", node.id)));
        }
        if !titles.insert(node.title.trim().to_string()) {
            return Err(invalid(format!("duplicate node title {:?}", node.title.trim())));
        }
    }

    // Rule 5
    let starts = nodes.iter().filter(|n| n.node_type() == NodeType::Start).count();
    let ends = nodes.iter().filter(|n| n.node_type() == NodeType::End).count();
    if starts != 1 {
        return Err(invalid(format!(
            "workflow must have exactly one start node, found {}",
            starts
        )));
    }
    if ends != 1 {
        return Err(invalid(format!(
            "workflow must have exactly one end node, found {}",
            ends
        )));
    }

    // Rule 6
    let types: HashMap<&str, NodeType> = nodes.iter().map(|n| (n.id.as_str(), n.node_type())).collect();
    let mut edges: Vec<Edge> = Vec::with_capacity(raw_edges.len());
    let mut edge_ids = HashSet::new();
    for (i, raw_edge) in raw_edges.into_iter().enumerate() {
        let edge: Edge = serde_json::from_value(raw_edge)
            .map_err(|e| invalid(format!("edge #{} is malformed: {}", i, e)))?;
        if !edge_ids.insert(edge.id.clone()) {
            return Err(invalid(format!("duplicate edge id {}", edge.id)));
        }
        for (end, declared) in [(&edge.source, edge.source_type), (&edge.target, edge.target_type)] {
            match types.get(end.as_str()) {
                None => {
                    return Err(invalid(format!(
                        "edge {} references unknown node {}",
                        edge.id, end
                    )))
                }
                Some(actual) if *actual != declared => {
                    return Err(invalid(format!(
                        "edge {} declares {} as {} but it is {}",
                        edge.id, end, declared, actual
                    )))
                }
                Some(_) => {}
            }
        }
        edges.push(edge);
    }

    // Rule 7
    let mut triples = HashSet::new();
    for edge in &edges {
        let key = (
            edge.source.clone(),
            edge.target.clone(),
            edge.source_handle_id.clone(),
        );
        if !triples.insert(key) {
            return Err(invalid(format!(
                "duplicate edge from {} to {}",
                edge.source, edge.target
            )));
        }
    }

    let mut graph = Graph { nodes, edges };
    normalize(&mut graph, ctx);

    // Rule 8
    let index = GraphIndex::build(&graph);
    let start_id = graph.start().map(|n| n.id.clone()).unwrap_or_default();
    let end_id = graph.end().map(|n| n.id.clone()).unwrap_or_default();

    // Rule 9
    let sources = index.sources();
    let sinks = index.sinks();
    if sources != [start_id.as_str()] || sinks != [end_id.as_str()] {
        if index.has_cycle() {
            return Err(invalid("workflow graph contains a cycle"));
        }
        if sources != [start_id.as_str()] {
            return Err(invalid(format!(
                "the start node must be the only node without incoming edges, found {:?}",
                sources
            )));
        }
        return Err(invalid(format!(
            "the end node must be the only node without outgoing edges, found {:?}",
            sinks
        )));
    }

    // Rule 10
    let reachable = index.reachable_from(&start_id);
    if let Some(orphan) = graph.nodes.iter().find(|n| !reachable.contains(&n.id)) {
        return Err(invalid(format!(
            "node {} is not reachable from the start node",
            orphan.id
        )));
    }

    // Rule 11
    if index.has_cycle() {
        return Err(invalid("workflow graph contains a cycle"));
    }

    // Rule 12
    for node in graph.nodes.iter().filter(|n| n.node_type() != NodeType::Start) {
        let ancestors = index.ancestors(&node.id);
        for var in &node.inputs {
            let VariableValue::Ref {
                ref_node_id,
                ref_var_name,
            } = &var.value
            else {
                continue;
            };
            if !ancestors.contains(ref_node_id) {
                return Err(invalid(format!(
                    "node {} input {} references {} which is not a predecessor",
                    node.id, var.name, ref_node_id
                )));
            }
            let target = graph
                .node(ref_node_id)
                .ok_or_else(|| invalid(format!("unknown node {}", ref_node_id)))?;
            if !target.output_names().contains(ref_var_name) {
                return Err(invalid(format!(
                    "node {} input {} references missing output {}.{}",
                    node.id, var.name, ref_node_id, ref_var_name
                )));
            }
        }
    }

    // Rule 13
    for node in &graph.nodes {
        check_node_kind(node, &graph)?;
    }

    Ok(graph)
}

fn check_variables(node: &Node, vars: &[Variable], what: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for var in vars {
        if !is_identifier(&var.name) {
            return Err(invalid(format!(
                "node {} {} name {:?} is not an identifier",
                node.id, what, var.name
            )));
        }
        if !seen.insert(var.name.as_str()) {
            return Err(invalid(format!(
                "node {} has duplicate {} {}",
                node.id, what, var.name
            )));
        }
    }
    Ok(())
}

fn check_node_shape(node: &Node) -> Result<()> {
    if node.id.trim().is_empty() {
        return Err(invalid("node id must not be empty"));
    }
    if node.title.trim().is_empty() {
        return Err(invalid(format!("node {} has an empty title", node.id)));
    }
    check_variables(node, &node.inputs, "input")?;
    check_variables(node, &node.outputs, "output")
}

fn normalize(graph: &mut Graph, ctx: &ValidationContext) {
    for node in &mut graph.nodes {
        match &mut node.data {
            NodeData::Start {} => {
                node.outputs = node
                    .inputs
                    .iter()
                    .map(|v| Variable {
                        value: VariableValue::default(),
                        ..v.clone()
                    })
                    .collect();
            }
            NodeData::End {} => node.outputs.clear(),
            NodeData::DatasetRetrieval { dataset_ids, .. } => {
                if let Some(allowed) = &ctx.accessible_dataset_ids {
                    dataset_ids.retain(|id| allowed.contains(id));
                }
                let mut seen = HashSet::new();
                dataset_ids.retain(|id| seen.insert(id.clone()));
            }
            NodeData::Iteration { workflow_ids } => {
                if let Some(own) = &ctx.workflow_id {
                    workflow_ids.retain(|id| id != own);
                }
            }
            _ => {}
        }
    }
}

fn single_input<'a>(node: &'a Node, name: &str) -> Result<&'a Variable> {
    if node.inputs.len() != 1 || node.inputs[0].name != name {
        return Err(invalid(format!(
            "{} node {} must have exactly one input named {}",
            node.node_type(),
            node.id,
            name
        )));
    }
    Ok(&node.inputs[0])
}

fn check_node_kind(node: &Node, graph: &Graph) -> Result<()> {
    match &node.data {
        NodeData::Start {} => {
            if let Some(var) = node
                .inputs
                .iter()
                .find(|v| matches!(v.value, VariableValue::Ref { .. }))
            {
                return Err(invalid(format!(
                    "start node input {} cannot be a reference",
                    var.name
                )));
            }
        }
        NodeData::End {} => {}
        NodeData::Llm { prompt, .. } => {
            if prompt.trim().is_empty() {
                return Err(invalid(format!("llm node {} has an empty prompt", node.id)));
            }
        }
        NodeData::TemplateTransform { template } => {
            if template.is_empty() {
                return Err(invalid(format!(
                    "template node {} has an empty template",
                    node.id
                )));
            }
        }
        NodeData::Code { code, .. } => {
            if code.trim().is_empty() {
                return Err(invalid(format!("code node {} has no code", node.id)));
            }
        }
        NodeData::Tool { tool_name, .. } => {
            if tool_name.trim().is_empty() {
                return Err(invalid(format!("tool node {} names no tool", node.id)));
            }
        }
        NodeData::HttpRequest { url: raw_url, .. } => {
            let parsed = url::Url::parse(raw_url).map_err(|e| {
                invalid(format!("http node {} url {:?}: {}", node.id, raw_url, e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(invalid(format!(
                    "http node {} url must be http or https",
                    node.id
                )));
            }
        }
        NodeData::DatasetRetrieval { retrieval_config, .. } => {
            let query = single_input(node, "query")?;
            if query.var_type != VariableType::String {
                return Err(invalid(format!(
                    "retrieval node {} query must be a string",
                    node.id
                )));
            }
            if retrieval_config.k == 0 {
                return Err(invalid(format!("retrieval node {} k must be >= 1", node.id)));
            }
        }
        NodeData::Iteration { workflow_ids } => {
            if workflow_ids.len() != 1 {
                return Err(invalid(format!(
                    "iteration node {} must bind exactly one workflow, found {}",
                    node.id,
                    workflow_ids.len()
                )));
            }
            let inputs = single_input(node, "inputs")?;
            if !inputs.var_type.is_array() {
                return Err(invalid(format!(
                    "iteration node {} inputs must be an array of primitives",
                    node.id
                )));
            }
        }
        NodeData::QuestionClassifier { classes } => {
            let query = single_input(node, "query")?;
            if query.var_type != VariableType::String {
                return Err(invalid(format!(
                    "classifier node {} query must be a string",
                    node.id
                )));
            }
            if classes.is_empty() {
                return Err(invalid(format!(
                    "classifier node {} must declare at least one class",
                    node.id
                )));
            }
            let handles: HashSet<&str> = graph
                .edges
                .iter()
                .filter(|e| e.source == node.id)
                .filter_map(|e| e.source_handle_id.as_deref())
                .collect();
            for class in classes {
                if !handles.contains(class.source_handle_id.as_str()) {
                    return Err(invalid(format!(
                        "classifier node {} class {:?} has no outgoing edge",
                        node.id, class.query
                    )));
                }
            }
        }
    }
    Ok(())
}
