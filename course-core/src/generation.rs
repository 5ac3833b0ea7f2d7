//! Remote text generation.
//!
//! Stages only see the `Generator` trait: one role and one prompt in, one
//! response text out. Retrying is the caller's job.

use crate::prompts::AgentRole;
use async_trait::async_trait;
use claude::{Claude, Message, Request};
use thiserror::Error;

/// A failed remote generation call.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{0}")]
    Api(#[from] claude::Error),

    #[error("generation service unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    /// Auth and request-shape rejections will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Api(e) => e.is_transient(),
            RemoteError::Unavailable(_) => true,
        }
    }
}

/// Something that can turn a prompt into text under a given role.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, role: AgentRole, prompt: &str) -> Result<String, RemoteError>;
}

/// `Generator` backed by the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct ClaudeGenerator {
    client: Claude,
    max_tokens: usize,
    temperature: Option<f32>,
}

impl ClaudeGenerator {
    pub fn new(client: Claude) -> Self {
        Self {
            client,
            max_tokens: 4096,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    fn build_request(&self, role: AgentRole, prompt: &str) -> Request {
        let mut request = Request::new(vec![Message::user(prompt)])
            .with_model(self.client.model())
            .with_max_tokens(self.max_tokens)
            .with_system(role.system_prompt());
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }
}

#[async_trait]
impl Generator for ClaudeGenerator {
    async fn generate(&self, role: AgentRole, prompt: &str) -> Result<String, RemoteError> {
        let request = self.build_request(role, prompt);
        let response = self.client.complete(request).await?;
        let text = response.text();
        tracing::debug!(
            role = role.name(),
            chars = text.len(),
            output_tokens = response.usage.output_tokens,
            "generation complete"
        );
        Ok(text)
    }
}
