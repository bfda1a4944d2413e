//! Tool-manager and code-runner collaborator interfaces.
//!
//! Both are consumed by workflow nodes. Implementations live in the
//! `llmops` app crate (a tool registry and a sandboxed Lua runner).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Invokes a named tool with JSON-encoded arguments.
///
/// An unknown tool is reported as an [`Error::NotFound`](crate::error::Error::NotFound)
/// wrapped in the returned `anyhow::Error`.
#[async_trait]
pub trait ToolManager: Send + Sync {
    async fn invoke(&self, name: &str, args_json: &str) -> anyhow::Result<String>;
}

/// One code execution request.
#[derive(Debug, Clone)]
pub struct CodeRequest {
    pub language: String,
    pub code: String,
    pub inputs: Map<String, Value>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

/// Executes an uninterpreted code payload and returns its output map.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, request: CodeRequest) -> anyhow::Result<Map<String, Value>>;
}
