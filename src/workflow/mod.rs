//! Workflow execution and lifecycle.
//!
//! Graph parsing and validation live in `llmops_core::workflow`; this
//! module runs validated graphs against the platform's collaborators and
//! manages the draft → debug → publish cycle.

pub mod executor;
mod nodes;
pub mod service;

pub use executor::{DebugEvent, NodeResult, NodeStatus, RunOutcome, WorkflowExecutor};
pub use nodes::MAX_ITERATION_DEPTH;
pub use service::{DebugRun, WorkflowMeta, WorkflowService};
