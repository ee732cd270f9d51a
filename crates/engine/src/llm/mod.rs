//! LLM port types and provider bindings.
//!
//! The inference gateway is the only component that talks to an LLM; the
//! rest of the engine sees `CompletionClient` and the typed error taxonomy.

mod gateway;
mod google;
mod openai;

pub use gateway::{
    CallSpec, InferenceGateway, SpokenOutcome, TurnGuards, CANNED_TROUBLE_MESSAGE,
    MAX_FALLBACK_MODELS, REFUSAL_PREFIXES,
};
pub use google::GoogleGenClient;
pub use openai::OpenAiCompatClient;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Fixed nucleus-sampling cutoff passed where the provider supports it.
pub const FIXED_TOP_P: f32 = 0.95;

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A message in the conversation sent to a provider
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// One inference call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            temperature: 0.7,
            top_p: FIXED_TOP_P,
            max_tokens: 1024,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Typed inference errors.
///
/// The gateway recovers from `ContextOverflow` (one summarization retry) and
/// classifies `RefusalDetected`/`Duplicate` itself; everything else returns
/// to the caller unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Inference call exceeded its deadline")]
    Timeout,

    #[error("Provider rejected the request: maximum context length exceeded")]
    ContextOverflow,

    #[error("Response matched a refusal prefix")]
    RefusalDetected,

    #[error("Response duplicated an earlier reply from the same speaker")]
    Duplicate,

    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

impl InferenceError {
    /// Short stable kind string for structured logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Config(_) => "config",
            InferenceError::Transport(_) => "transport",
            InferenceError::Unauthorized(_) => "unauthorized",
            InferenceError::Timeout => "timeout",
            InferenceError::ContextOverflow => "context_overflow",
            InferenceError::RefusalDetected => "refusal",
            InferenceError::Duplicate => "duplicate",
            InferenceError::Malformed(_) => "malformed",
        }
    }

    /// Polite user-facing string appended to the conversation as a system
    /// note. The raw kind is logged, never shown.
    pub fn user_facing(&self) -> String {
        match self {
            InferenceError::Timeout => "Sorry, the request timed out.".to_string(),
            other => format!("Sorry, API error: {}", other.kind()),
        }
    }
}

/// Abstract inference capability.
///
/// Implementations must be safe to call concurrently from multiple tabs and
/// must carry no per-call cross-tab state.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String, InferenceError>;
}

/// Marker the providers look for when deciding a rejection is an overflow.
pub(crate) fn is_overflow_message(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("maximum context length") || lower.contains("context length exceeded")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(InferenceError::Timeout.kind(), "timeout");
        assert_eq!(InferenceError::ContextOverflow.kind(), "context_overflow");
        assert_eq!(
            InferenceError::Transport("boom".into()).kind(),
            "transport"
        );
    }

    #[test]
    fn test_user_facing_strings_are_polite() {
        assert_eq!(
            InferenceError::Timeout.user_facing(),
            "Sorry, the request timed out."
        );
        assert_eq!(
            InferenceError::Transport("x".into()).user_facing(),
            "Sorry, API error: transport"
        );
    }

    #[test]
    fn test_overflow_detection() {
        assert!(is_overflow_message(
            "This model's maximum context length is 8192 tokens"
        ));
        assert!(!is_overflow_message("rate limit exceeded"));
    }
}
