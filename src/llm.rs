//! LLM client abstraction
//!
//! Stages never talk to a provider directly: every call goes through the
//! prompt guard and privilege gate first, and the response lands verbatim
//! in the stage trace so replay never re-invokes the model. The mock
//! client keeps the pipeline deterministic for tests and offline runs.

use async_trait::async_trait;

use crate::Result;

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Object-safe seam over an LLM provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<LlmResponse>;
}

/// Approximate token count for budgeting and gate checks.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.len() + 3) / 4) as u64
}

/// Deterministic stand-in for a real provider.
/// Keeps the pipeline functional without network access.
pub struct MockLlm {
    canned_reply: String,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            canned_reply: "No additional categories.".to_string(),
        }
    }

    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self {
            canned_reply: reply.into(),
        }
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<LlmResponse> {
        Ok(LlmResponse {
            text: self.canned_reply.clone(),
            tokens_in: estimate_tokens(system_prompt) + estimate_tokens(prompt),
            tokens_out: estimate_tokens(&self.canned_reply),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[tokio::test]
    async fn test_mock_is_deterministic() {
        let llm = MockLlm::new();
        let a = llm.generate("system", "prompt").await.unwrap();
        let b = llm.generate("system", "prompt").await.unwrap();
        assert_eq!(a.text, b.text);
        assert_eq!(a.tokens_in, b.tokens_in);
    }
}
