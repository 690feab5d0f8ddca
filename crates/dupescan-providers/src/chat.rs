use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ratelimit::{is_retryable_status, RateLimiter, RetryOutcome};

/// Outcome of a single chat/LLM call: the text response plus token usage for
/// scan accounting (counted under `chatInputTokens`/`chatOutputTokens`).
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<ChatResponse>;
}

pub struct HostedChatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    limiter: RateLimiter,
}

impl HostedChatProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            limiter,
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: ChatUsage,
}

#[async_trait]
impl ChatProvider for HostedChatProvider {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let outcome = self
            .limiter
            .run(|_attempt| async {
                let response = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&ChatRequest {
                        model: &self.model,
                        messages: vec![
                            ChatMessage {
                                role: "system",
                                content: system_prompt,
                            },
                            ChatMessage {
                                role: "user",
                                content: user_prompt,
                            },
                        ],
                    })
                    .send()
                    .await
                    .context("chat request failed")?;

                let status = response.status();
                if is_retryable_status(status) {
                    return Ok(RetryOutcome::Retry(format!("chat provider returned {status}")));
                }
                if !status.is_success() {
                    anyhow::bail!("chat provider returned {status}: {}", response.text().await.unwrap_or_default());
                }
                let parsed: ChatCompletionResponse =
                    response.json().await.context("failed to parse chat response")?;
                Ok(RetryOutcome::Done(parsed))
            })
            .await?;

        let content = outcome
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        info!(
            model = %self.model,
            input_tokens = outcome.usage.prompt_tokens,
            output_tokens = outcome.usage.completion_tokens,
            "chat completion finished"
        );

        Ok(ChatResponse {
            content,
            input_tokens: outcome.usage.prompt_tokens,
            output_tokens: outcome.usage.completion_tokens,
        })
    }
}

/// Fake that returns a caller-seeded canned response, for phase-processor
/// tests that don't want to exercise real HTTP.
pub struct FakeChatProvider {
    pub response: String,
}

impl FakeChatProvider {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

#[async_trait]
impl ChatProvider for FakeChatProvider {
    async fn complete(&self, _system_prompt: &str, user_prompt: &str) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: self.response.clone(),
            input_tokens: (user_prompt.len() / 4) as i64,
            output_tokens: (self.response.len() / 4) as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_chat_provider_echoes_seeded_response() {
        let provider = FakeChatProvider::new(r#"{"relationship":"duplicate","confidence":0.9}"#);
        let response = provider.complete("system", "compare these two PRs").await.unwrap();
        assert!(response.content.contains("duplicate"));
        assert!(response.input_tokens > 0);
        assert!(response.output_tokens > 0);
    }
}
