//! Workflow graph model, adjacency index, validator and templating.

pub mod entities;
pub mod graph;
pub mod template;
pub mod validator;

pub use entities::{Edge, Graph, Node, NodeData, NodeType, Variable, VariableType, VariableValue};
pub use graph::GraphIndex;
pub use validator::{validate_graph, validate_workflow_meta, ValidationContext};
