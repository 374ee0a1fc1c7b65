//! LLM client module for the reasoning and vision models.
//!
//! Provides a trait-based abstraction over model providers, with the
//! Anthropic Messages API as the primary implementation.
//!
//! Supports multimodal content (text + images) for vision-capable models.

mod anthropic;
pub mod error;
pub mod gateway;

pub use anthropic::AnthropicClient;
pub use error::{classify_error_message, classify_http_status, LlmError, LlmErrorKind};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role in a chat conversation. The system prompt travels outside the
/// message list in the Messages API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Base64 image payload for vision content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    /// Create a base64 PNG source.
    pub fn png(data: impl Into<String>) -> Self {
        Self {
            source_type: "base64".to_string(),
            media_type: "image/png".to_string(),
            data: data.into(),
        }
    }
}

/// One content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text content
    Text { text: String },
    /// Inline image (for vision models)
    Image { source: ImageSource },
    /// Tool invocation emitted by the model
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Result of a tool invocation, echoed back to the model
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image_png(data: impl Into<String>) -> Self {
        ContentBlock::Image {
            source: ImageSource::png(data),
        }
    }
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    /// Create a plain text message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Create a user message carrying text plus one image.
    pub fn user_with_image(text: impl Into<String>, image_base64: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![
                ContentBlock::text(text),
                ContentBlock::image_png(image_base64),
            ],
        }
    }

    /// Get the first text block, if any.
    pub fn as_text(&self) -> Option<&str> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters, passed through untyped
    pub input_schema: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Token usage information (if provided by the provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Response from a chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Concatenated text blocks, if any
    pub content: Option<String>,
    /// Tool invocations in the order the model emitted them
    pub tool_uses: Vec<ToolUse>,
    pub stop_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    /// Text content, or empty string.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Optional parameters for chat completions.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Sampling temperature (0 = deterministic)
    pub temperature: Option<f64>,
    /// Maximum output tokens to generate
    pub max_tokens: u64,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            max_tokens: 4096,
        }
    }
}

/// Trait for LLM clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request.
    async fn chat(
        &self,
        model: &str,
        system: Option<&str>,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: ChatOptions,
    ) -> Result<ChatResponse, LlmError>;
}
