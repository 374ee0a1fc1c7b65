//! Anthropic Messages API client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{classify_error_message, classify_http_status, LlmError, LlmErrorKind};
use super::{
    ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage, ToolDefinition, ToolUse,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client. Retry policy lives in the gateways, not
/// here: a single call either succeeds or returns a classified `LlmError`.
pub struct AnthropicClient {
    client: Client,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .unwrap_or_default();
        Self { client, api_key }
    }

    fn create_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        let status_code = status.as_u16();
        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body.to_string()),
            LlmErrorKind::ClientError => {
                // Some providers return rate-limit text under other 4xx codes
                if classify_error_message(body) == LlmErrorKind::RateLimited {
                    LlmError::rate_limited(body.to_string())
                } else {
                    LlmError::client_error(status_code, body.to_string())
                }
            }
            _ => LlmError::server_error(status_code, body.to_string()),
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn chat(
        &self,
        model: &str,
        system: Option<&str>,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let request = MessagesRequest {
            model: model.to_string(),
            max_tokens: options.max_tokens,
            system: system.map(str::to_string),
            messages: messages.to_vec(),
            tools: tools.map(|t| t.to_vec()),
            temperature: options.temperature,
        };

        tracing::debug!(model, messages = messages.len(), "sending messages request");

        let response = match self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    return Err(LlmError::network_error(format!("Request timeout: {}", e)));
                } else if e.is_connect() {
                    return Err(LlmError::network_error(format!("Connection failed: {}", e)));
                } else {
                    return Err(LlmError::network_error(format!("Request failed: {}", e)));
                }
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Self::create_error(status, &body));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        let mut text = String::new();
        let mut tool_uses = Vec::new();
        for block in parsed.content {
            match block {
                ResponseBlock::Text { text: t } => text.push_str(&t),
                ResponseBlock::ToolUse { id, name, input } => {
                    tool_uses.push(ToolUse { id, name, input });
                }
                ResponseBlock::Other => {}
            }
        }

        Ok(ChatResponse {
            content: if text.is_empty() { None } else { Some(text) },
            tool_uses,
            stop_reason: parsed.stop_reason,
            usage: parsed.usage.map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
        })
    }
}

/// Messages API request format.
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

/// Messages API response format.
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<UsageBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct UsageBlock {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}
