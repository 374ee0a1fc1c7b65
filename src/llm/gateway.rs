//! Reasoning and vision gateways.
//!
//! Both wrap a single model call with rate-limit-aware exponential backoff:
//! a rate-limit-classified error waits `base_wait * 2^attempt` and retries
//! up to `max_retries`; any other error propagates immediately.

use std::sync::Arc;

use crate::config::RateLimitConfig;
use crate::llm::{
    ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError, ToolDefinition, ToolUse,
};

async fn invoke_with_retry(
    client: &dyn LlmClient,
    model: &str,
    system: Option<&str>,
    messages: &[ChatMessage],
    tools: Option<&[ToolDefinition]>,
    options: ChatOptions,
    retry: &RateLimitConfig,
) -> Result<ChatResponse, LlmError> {
    let mut attempt: u32 = 0;
    loop {
        match client
            .chat(model, system, messages, tools, options.clone())
            .await
        {
            Ok(response) => {
                if attempt > 0 {
                    tracing::info!(attempt, model, "model call succeeded after backoff");
                }
                return Ok(response);
            }
            Err(error) if error.is_rate_limited() && attempt < retry.max_retries => {
                let wait = retry.base_wait * 2u32.saturating_pow(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = retry.max_retries,
                    wait_secs = wait.as_secs(),
                    "rate limit hit, backing off"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(error) => {
                tracing::error!(model, %error, "model call failed");
                return Err(error);
            }
        }
    }
}

/// Gateway to the planning/reasoning model.
#[derive(Clone)]
pub struct ReasoningGateway {
    client: Arc<dyn LlmClient>,
    model: String,
    retry: RateLimitConfig,
}

impl ReasoningGateway {
    pub fn new(client: Arc<dyn LlmClient>, model: String, retry: RateLimitConfig) -> Self {
        Self {
            client,
            model,
            retry,
        }
    }

    /// One text-in, text-out turn.
    pub async fn complete_text(
        &self,
        system: Option<&str>,
        prompt: &str,
    ) -> Result<String, LlmError> {
        let messages = vec![ChatMessage::text(crate::llm::Role::User, prompt)];
        let response = invoke_with_retry(
            self.client.as_ref(),
            &self.model,
            system,
            &messages,
            None,
            ChatOptions::default(),
            &self.retry,
        )
        .await?;
        Ok(response.text().to_string())
    }

    /// One turn with tools advertised; returns the model's tool invocations
    /// in emission order (possibly empty) plus any accompanying text.
    pub async fn propose_tool_calls(
        &self,
        system: Option<&str>,
        prompt: &str,
        tools: &[ToolDefinition],
    ) -> Result<(Vec<ToolUse>, String), LlmError> {
        let messages = vec![ChatMessage::text(crate::llm::Role::User, prompt)];
        let response = invoke_with_retry(
            self.client.as_ref(),
            &self.model,
            system,
            &messages,
            Some(tools),
            ChatOptions::default(),
            &self.retry,
        )
        .await?;
        let text = response.text().to_string();
        Ok((response.tool_uses, text))
    }
}

/// Gateway to the vision model. Accepts one or two images plus a prompt and
/// returns the model's free-form feedback text; callers extract scores from
/// it downstream.
#[derive(Clone)]
pub struct VisionGateway {
    client: Arc<dyn LlmClient>,
    model: String,
    retry: RateLimitConfig,
}

impl VisionGateway {
    pub fn new(client: Arc<dyn LlmClient>, model: String, retry: RateLimitConfig) -> Self {
        Self {
            client,
            model,
            retry,
        }
    }

    /// Analyze a single image.
    pub async fn analyze(&self, prompt: &str, image_base64: &str) -> Result<String, LlmError> {
        let messages = vec![ChatMessage::user_with_image(prompt, image_base64)];
        self.feedback(&messages).await
    }

    /// Compare two images (reference first, candidate second).
    pub async fn compare(
        &self,
        prompt: &str,
        reference_base64: &str,
        candidate_base64: &str,
    ) -> Result<String, LlmError> {
        let messages = vec![ChatMessage {
            role: crate::llm::Role::User,
            content: vec![
                crate::llm::ContentBlock::text(prompt),
                crate::llm::ContentBlock::image_png(reference_base64),
                crate::llm::ContentBlock::image_png(candidate_base64),
            ],
        }];
        self.feedback(&messages).await
    }

    async fn feedback(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let options = ChatOptions {
            temperature: Some(0.3),
            max_tokens: 1024,
        };
        let response = invoke_with_retry(
            self.client.as_ref(),
            &self.model,
            None,
            messages,
            None,
            options,
            &self.retry,
        )
        .await?;
        Ok(response.text().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, LlmError, Role, ToolDefinition};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails with a rate limit `failures` times, then succeeds.
    struct FlakyClient {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn chat(
            &self,
            _model: &str,
            _system: Option<&str>,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _options: ChatOptions,
        ) -> Result<ChatResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(LlmError::rate_limited("rate_limit_error".to_string()))
            } else {
                Ok(ChatResponse {
                    content: Some("ok".to_string()),
                    tool_uses: vec![],
                    stop_reason: Some("end_turn".to_string()),
                    usage: None,
                })
            }
        }
    }

    struct PermanentFailure;

    #[async_trait]
    impl LlmClient for PermanentFailure {
        async fn chat(
            &self,
            _model: &str,
            _system: Option<&str>,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _options: ChatOptions,
        ) -> Result<ChatResponse, LlmError> {
            Err(LlmError::client_error(400, "bad request".to_string()))
        }
    }

    fn fast_retry(max_retries: u32) -> RateLimitConfig {
        RateLimitConfig {
            max_retries,
            base_wait: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_rate_limits_then_succeeds() {
        let client = Arc::new(FlakyClient {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let gateway = ReasoningGateway::new(client.clone(), "test-model".into(), fast_retry(5));

        let text = gateway.complete_text(None, "hello").await.unwrap();
        assert_eq!(text, "ok");
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_propagate() {
        let client = Arc::new(FlakyClient {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let gateway = ReasoningGateway::new(client.clone(), "test-model".into(), fast_retry(2));

        let err = gateway.complete_text(None, "hello").await.unwrap_err();
        assert!(err.is_rate_limited());
        // initial attempt + 2 retries
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_rate_limit_errors_propagate_immediately() {
        let gateway =
            ReasoningGateway::new(Arc::new(PermanentFailure), "test-model".into(), fast_retry(5));

        let err = gateway.complete_text(None, "hello").await.unwrap_err();
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn user_message_shape() {
        let msg = ChatMessage::text(Role::User, "hi");
        assert_eq!(msg.as_text(), Some("hi"));
    }
}
