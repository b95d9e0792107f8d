//! Mock capability provider for tests and demos.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::ports::{
    CapabilityProvider, ChatMessage, GenerationOptions, ProviderError, ProviderResult,
};

const EMBEDDING_DIMENSIONS: usize = 16;

/// Deterministic provider: echoes prompts (or a canned response) and derives
/// embeddings from a hash of the input.
pub struct MockProvider {
    name: String,
    canned_response: Option<String>,
    fail: bool,
    calls: AtomicU64,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            canned_response: None,
            fail: false,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_canned_response(mut self, response: impl Into<String>) -> Self {
        self.canned_response = Some(response.into());
        self
    }

    /// Every call fails with a request error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(&self, input: &str) -> ProviderResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Request(format!("{} is configured to fail", self.name)));
        }
        Ok(self
            .canned_response
            .clone()
            .unwrap_or_else(|| format!("mock response to: {input}")))
    }
}

#[async_trait]
impl CapabilityProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_text(&self, prompt: &str, _options: &GenerationOptions) -> ProviderResult<String> {
        self.respond(prompt)
    }

    async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> ProviderResult<String> {
        let last = messages.last().map_or("", |m| m.content.as_str());
        self.respond(last)
    }

    async fn embed(&self, text: &str) -> ProviderResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Request(format!("{} is configured to fail", self.name)));
        }
        let digest = Sha256::digest(text.as_bytes());
        Ok(digest
            .iter()
            .take(EMBEDDING_DIMENSIONS)
            .map(|b| f32::from(*b) / 255.0)
            .collect())
    }
}
