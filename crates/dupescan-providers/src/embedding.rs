use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ratelimit::{is_retryable_status, RateLimiter, RetryOutcome};

/// `TOKEN_BUDGET_FACTOR` applied to a model's context window before text is
/// truncated, matching `dupescan_core::types::TOKEN_BUDGET_FACTOR`.
pub use dupescan_core::types::TOKEN_BUDGET_FACTOR;

/// Whitespace/byte-ratio token estimator standing in for a model-specific BPE
/// tokenizer. Takes the max of a whitespace-word count and a byte/4 estimate,
/// biasing toward over-counting so the budget check truncates at least as
/// aggressively as the real tokenizer would (see DESIGN.md's Open Question
/// resolution).
pub fn estimate_tokens(text: &str) -> usize {
    let whitespace_words = text.split_whitespace().count();
    let byte_estimate = text.len() / 4;
    whitespace_words.max(byte_estimate).max(1)
}

/// Truncates `text` so its estimated token count fits within
/// `context_window as f64 * TOKEN_BUDGET_FACTOR`, cutting from the end.
pub fn truncate_to_budget(text: &str, context_window: u32) -> String {
    let budget = (context_window as f64 * TOKEN_BUDGET_FACTOR) as usize;
    if estimate_tokens(text) <= budget {
        return text.to_string();
    }
    // Binary-search-free linear shrink: char boundaries make byte-indexing
    // unsafe, so truncate on whitespace boundaries from the end.
    let mut words: Vec<&str> = text.split_whitespace().collect();
    while !words.is_empty() && estimate_tokens(&words.join(" ")) > budget {
        words.pop();
    }
    words.join(" ")
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds a batch of texts, returning one vector per input in order.
    /// Token usage for the batch is returned alongside for scan accounting.
    async fn embed_batch(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, i64)>;

    fn context_window(&self) -> u32;
}

pub struct HostedEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    context_window: u32,
    limiter: RateLimiter,
}

impl HostedEmbeddingProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        context_window: u32,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            context_window,
            limiter,
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponseItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbedUsage {
    prompt_tokens: i64,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedResponseItem>,
    usage: EmbedUsage,
}

#[async_trait]
impl EmbeddingProvider for HostedEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, i64)> {
        let truncated: Vec<String> = texts
            .iter()
            .map(|t| truncate_to_budget(t, self.context_window))
            .collect();

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let outcome = self
            .limiter
            .run(|_attempt| async {
                let response = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&EmbedRequest {
                        model: &self.model,
                        input: &truncated,
                    })
                    .send()
                    .await
                    .context("embedding request failed")?;

                let status = response.status();
                if is_retryable_status(status) {
                    return Ok(RetryOutcome::Retry(format!("embedding provider returned {status}")));
                }
                if !status.is_success() {
                    anyhow::bail!("embedding provider returned {status}: {}", response.text().await.unwrap_or_default());
                }
                let parsed: EmbedResponse = response.json().await.context("failed to parse embedding response")?;
                Ok(RetryOutcome::Done(parsed))
            })
            .await?;

        info!(batch_size = texts.len(), model = %self.model, tokens = outcome.usage.prompt_tokens, "embedded batch");
        Ok((
            outcome.data.into_iter().map(|d| d.embedding).collect(),
            outcome.usage.prompt_tokens,
        ))
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }
}

/// Deterministic fake for tests: a stable, low-dimensional hash-based vector
/// so cosine similarity between near-duplicate texts is meaningfully high.
pub struct FakeEmbeddingProvider {
    pub context_window: u32,
}

impl Default for FakeEmbeddingProvider {
    fn default() -> Self {
        Self {
            context_window: 8191,
        }
    }
}

fn hash_embed(text: &str) -> Vec<f32> {
    let mut buckets = [0f32; 16];
    for (i, word) in text.split_whitespace().enumerate() {
        let hash: u64 = word.bytes().fold(5381u64, |h, b| h.wrapping_mul(33).wrapping_add(b as u64));
        buckets[(hash as usize + i) % 16] += 1.0;
    }
    buckets.to_vec()
}

#[async_trait]
impl EmbeddingProvider for FakeEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, i64)> {
        let tokens: i64 = texts.iter().map(|t| estimate_tokens(t) as i64).sum();
        Ok((texts.iter().map(|t| hash_embed(t)).collect(), tokens))
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_never_zero_for_nonempty_text() {
        assert!(estimate_tokens("a") >= 1);
        assert!(estimate_tokens("hello world") >= 2);
    }

    #[test]
    fn truncate_to_budget_shrinks_oversized_text() {
        let long_text = "word ".repeat(10_000);
        let truncated = truncate_to_budget(&long_text, 100);
        assert!(estimate_tokens(&truncated) <= (100.0 * TOKEN_BUDGET_FACTOR) as usize);
        assert!(truncated.len() < long_text.len());
    }

    #[test]
    fn truncate_to_budget_is_noop_within_budget() {
        let text = "short text";
        assert_eq!(truncate_to_budget(text, 8191), text);
    }

    #[tokio::test]
    async fn fake_provider_gives_similar_vectors_for_similar_text() {
        let provider = FakeEmbeddingProvider::default();
        let (vectors, _) = provider
            .embed_batch(&["fix null pointer bug".to_string(), "fix null pointer bug".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors[0], vectors[1]);
    }
}
