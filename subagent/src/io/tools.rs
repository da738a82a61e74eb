//! Tool registry contract.
//!
//! The engine does not validate tool semantics. It only checks that an
//! invoked name is within the scope's permission set before dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Name of the built-in output tool. Always permitted.
pub const EMIT_VARIABLE_TOOL: &str = "emit_variable";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the arguments object.
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    json!({"type": "object"})
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_object_schema(),
        }
    }

    /// Schema of the built-in `emit_variable` tool.
    pub fn emit_variable() -> Self {
        Self {
            name: EMIT_VARIABLE_TOOL.to_string(),
            description: "Record a named output value for the caller.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["name", "value"],
                "properties": {
                    "name": {"type": "string", "pattern": "^[A-Za-z_][A-Za-z0-9_-]*$"},
                    "value": {}
                }
            }),
        }
    }
}

/// Result of one tool invocation, fed back to the model verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn tool_schemas(&self) -> Vec<ToolSchema>;

    /// Run one tool. An `Err` is a dispatch failure; it is surfaced to the
    /// model as an error result, never propagated out of the loop.
    async fn invoke(&self, name: &str, arguments: &Value) -> anyhow::Result<ToolOutput>;
}

/// Registry with no tools, for scopes that only emit variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTools;

#[async_trait]
impl ToolRegistry for NoTools {
    fn tool_schemas(&self) -> Vec<ToolSchema> {
        Vec::new()
    }

    async fn invoke(&self, name: &str, _arguments: &Value) -> anyhow::Result<ToolOutput> {
        Err(anyhow::anyhow!("no tool named '{name}' is registered"))
    }
}
