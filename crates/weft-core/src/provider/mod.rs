//! Provider layer — uniform LLM interface with failover and retry.
//!
//! Every provider exposes the same contract: build a [`CompletionRequest`],
//! get back a [`CompletionResponse`]. Concrete backends register into a
//! [`ProviderRegistry`] under a stable name; the engine never talks to a
//! vendor API directly, it talks to a [`FailoverChain`] over ordered
//! `{provider, model}` bindings.

pub mod failover;
pub mod http;
pub mod retry;

pub use failover::{AttemptRecord, FailoverChain, ProviderBinding};
pub use http::{Dialect, HttpProvider};
pub use retry::{Backoff, RetryPolicy};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::tools::ToolSchema;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn in the conversation sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Set on `Tool` messages: the id of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on `Assistant` messages that requested tool invocations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The provider-facing request contract.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

/// Token accounting returned by a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The provider-facing response contract.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub model: String,
}

/// Errors surfaced by the provider layer. Each carries the offending
/// provider's identity so failover records stay attributable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("[{provider}] transport error: {message}")]
    Transport { provider: String, message: String },

    #[error("[{provider}] rate limited (retry after {retry_after:?})")]
    RateLimit {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("[{provider}] timed out after {elapsed:?}")]
    Timeout { provider: String, elapsed: Duration },

    #[error("[{provider}] rejected ({status}): {message}")]
    Rejected {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("unknown provider '{0}'")]
    Unknown(String),
}

impl ProviderError {
    /// The provider this error originated from, when attributable.
    pub fn provider(&self) -> Option<&str> {
        match self {
            ProviderError::Transport { provider, .. }
            | ProviderError::RateLimit { provider, .. }
            | ProviderError::Timeout { provider, .. }
            | ProviderError::Rejected { provider, .. } => Some(provider),
            ProviderError::Unknown(_) => None,
        }
    }

    /// Whether a retry against the same provider could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport { .. } => true,
            ProviderError::RateLimit { .. } => true,
            ProviderError::Timeout { .. } => true,
            ProviderError::Rejected { status, .. } => *status >= 500,
            ProviderError::Unknown(_) => false,
        }
    }
}

/// Uniform LLM backend contract.
///
/// `stream` and `embeddings` have conservative defaults so simple backends
/// (including test stubs) only implement `complete`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable registry name, e.g. `"anthropic"`.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest)
        -> Result<CompletionResponse, ProviderError>;

    /// Stream content chunks through `chunk_tx`, returning the final
    /// response. The default completes non-streaming and emits one chunk.
    async fn stream(
        &self,
        request: &CompletionRequest,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.complete(request).await?;
        let _ = chunk_tx.send(response.content.clone()).await;
        Ok(response)
    }

    async fn embeddings(
        &self,
        _model: &str,
        _input: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Rejected {
            provider: self.name().to_string(),
            status: 501,
            message: "embeddings not supported by this provider".to_string(),
        })
    }
}

/// Name → provider lookup. Read-only after construction.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::Unknown(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
