//! Tool registry backing the workflow tool node.
//!
//! A [`Tool`] takes JSON parameters and returns a JSON value. The
//! [`ToolRegistry`] implements [`ToolManager`]: it looks tools up by name,
//! decodes the argument string, and renders the result as text (strings
//! verbatim, anything else as JSON).
//!
//! # Built-in Tools
//!
//! | Tool | Description |
//! |------|-------------|
//! | `current_time` | Current UTC time, optionally formatted with a `strftime` pattern |

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use llmops_core::tool::ToolManager;
use llmops_core::Error;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn is_builtin(&self) -> bool {
        false
    }

    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value) -> Result<Value>;
}

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Return the current UTC time"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "format": { "type": "string", "description": "strftime pattern", "default": "%Y-%m-%d %H:%M:%S" }
            }
        })
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let format = params["format"].as_str().unwrap_or("%Y-%m-%d %H:%M:%S");
        Ok(Value::String(chrono::Utc::now().format(format).to_string()))
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CurrentTimeTool));
        registry
    }

    /// Register a tool. A later registration shadows an earlier one with
    /// the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

#[async_trait]
impl ToolManager for ToolRegistry {
    async fn invoke(&self, name: &str, args_json: &str) -> Result<String> {
        let tool = self
            .find(name)
            .ok_or_else(|| Error::not_found(format!("tool {}", name)))?;
        let params: Value = if args_json.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(args_json)
                .map_err(|e| Error::validation(format!("tool {} arguments: {}", name, e)))?
        };
        let out = tool.execute(params).await?;
        Ok(match out {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmops_core::ErrorKind;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo parameters back"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(&self, params: Value) -> Result<Value> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn test_invoke_serializes_non_string_results() {
        let mut registry = ToolRegistry::with_builtins();
        registry.register(Arc::new(EchoTool));
        let out = registry.invoke("echo", r#"{"a":1}"#).await.unwrap();
        assert_eq!(out, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_current_time_format() {
        let registry = ToolRegistry::with_builtins();
        let out = registry
            .invoke("current_time", r#"{"format":"%Y"}"#)
            .await
            .unwrap();
        assert_eq!(out.len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let registry = ToolRegistry::with_builtins();
        let err = registry.invoke("nope", "{}").await.unwrap_err();
        let kind = err.downcast_ref::<Error>().map(Error::kind);
        assert_eq!(kind, Some(ErrorKind::NotFound));
    }

    #[test]
    fn test_register_shadows_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(EchoTool));
        assert_eq!(registry.len(), 1);
        assert!(!registry.find("echo").unwrap().is_builtin());
    }
}
