//! Model client contract and conversation message types.
//!
//! The loop owns all retry policy; a [`ModelClient`] makes exactly one
//! attempt per call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::io::tools::ToolSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `Role::Tool` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            is_error,
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// One model round.
///
/// `parse_error` is set when the client received output it could not
/// interpret; the loop then issues a correction and retries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tools(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            parse_error: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Parse failure as reported, or an empty round with nothing to act on.
    pub fn malformation(&self) -> Option<String> {
        if let Some(reason) = &self.parse_error {
            return Some(reason.clone());
        }
        if self.tool_calls.is_empty() && self.content.trim().is_empty() {
            return Some("empty response".to_string());
        }
        None
    }
}

pub struct GenerateOptions<'a> {
    /// Schemas of the tools this scope may call.
    pub tools: &'a [ToolSchema],
    pub cancellation: &'a CancellationToken,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate_response(
        &self,
        history: &[Message],
        options: GenerateOptions<'_>,
    ) -> anyhow::Result<ModelResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_response_counts_as_malformed() {
        assert_eq!(
            ModelResponse::text("   ").malformation().as_deref(),
            Some("empty response")
        );
        assert!(ModelResponse::text("done").malformation().is_none());
        let call = ToolCall::new("1", "read", json!({}));
        assert!(ModelResponse::with_tools(vec![call]).malformation().is_none());
    }

    #[test]
    fn tool_message_serializes_compactly() {
        let value = serde_json::to_value(Message::user("hi")).expect("serialize");
        assert_eq!(value, json!({"role": "user", "content": "hi"}));
        let value = serde_json::to_value(Message::tool_result("c1", "boom", true)).expect("serialize");
        assert_eq!(value["tool_call_id"], json!("c1"));
        assert_eq!(value["is_error"], json!(true));
    }
}
