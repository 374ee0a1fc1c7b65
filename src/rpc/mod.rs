//! RPC client for the controlled application's tool endpoint.
//!
//! The controlled application (e.g. a Blender tool server) exposes a
//! dynamic set of named tools over a persistent JSON channel. Tools are
//! discovered at connection start; nothing beyond name strings is
//! hardcoded here.

mod client;

pub use client::StdioToolClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::ToolDefinition;

/// Transport-level RPC errors. A tool reporting failure is not an
/// `RpcError`; that surfaces as `ToolOutcome { success: false, .. }`.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Failed to spawn tool endpoint: {0}")]
    Spawn(String),

    #[error("Channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tool call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel closed by peer")]
    Closed,
}

/// A tool advertised by the controlled application. Only `name` is
/// validated structurally; the schema blob passes through untyped to the
/// reasoning model's request builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

impl From<&ToolSchema> for ToolDefinition {
    fn from(schema: &ToolSchema) -> Self {
        let input_schema = if schema.input_schema.is_object() {
            schema.input_schema.clone()
        } else {
            serde_json::json!({ "type": "object", "properties": {} })
        };
        ToolDefinition {
            name: schema.name.clone(),
            description: if schema.description.is_empty() {
                format!("Execute {}", schema.name)
            } else {
                schema.description.clone()
            },
            input_schema,
        }
    }
}

/// Result of one tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    /// Result text on success, error text on failure
    pub result: String,
    /// Base64 payload for artifact-producing tools (e.g. screenshots)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ToolOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: message.into(),
            image_data: None,
            mime_type: None,
        }
    }
}

/// Trait for tool-call clients.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Discover the tool set. Called once at connection start.
    async fn list_tools(&self) -> Result<Vec<ToolSchema>, RpcError>;

    /// Invoke a named tool with JSON arguments.
    async fn call_tool(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<ToolOutcome, RpcError>;
}

/// Wire request: one JSON object per line on the channel.
#[derive(Debug, Serialize)]
pub(crate) struct WireRequest<'a> {
    pub tool: &'a str,
    pub params: &'a serde_json::Value,
}

/// Wire response.
#[derive(Debug, Deserialize)]
pub(crate) struct WireResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub image_data: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl WireResponse {
    pub fn into_outcome(self) -> ToolOutcome {
        let text = if self.success {
            self.result.as_ref().map(value_to_text).unwrap_or_default()
        } else {
            self.error
                .as_ref()
                .or(self.result.as_ref())
                .map(value_to_text)
                .unwrap_or_else(|| "unknown tool error".to_string())
        };
        ToolOutcome {
            success: self.success,
            result: text,
            image_data: self.image_data,
            mime_type: self.mime_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_to_definition_defaults() {
        let schema = ToolSchema {
            name: "get_scene_info".to_string(),
            description: String::new(),
            input_schema: serde_json::Value::Null,
        };
        let def = ToolDefinition::from(&schema);
        assert_eq!(def.name, "get_scene_info");
        assert_eq!(def.description, "Execute get_scene_info");
        assert!(def.input_schema.is_object());
    }

    #[test]
    fn wire_response_error_text() {
        let raw = r#"{"success": false, "error": "Object not found"}"#;
        let resp: WireResponse = serde_json::from_str(raw).unwrap();
        let outcome = resp.into_outcome();
        assert!(!outcome.success);
        assert_eq!(outcome.result, "Object not found");
    }

    #[test]
    fn wire_response_with_artifact() {
        let raw = r#"{"success": true, "result": "captured", "image_data": "aGVsbG8=", "mime_type": "image/png"}"#;
        let resp: WireResponse = serde_json::from_str(raw).unwrap();
        let outcome = resp.into_outcome();
        assert!(outcome.success);
        assert_eq!(outcome.image_data.as_deref(), Some("aGVsbG8="));
    }
}
