//! Google-style generative-language client
//!
//! The provider has no system role, so system messages are re-encoded as
//! user turns tagged `[SYSTEM]` before dispatch.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{is_overflow_message, ChatRequest, CompletionClient, InferenceError, MessageRole};

/// Client for a Google-style `generateContent` API
#[derive(Clone)]
pub struct GoogleGenClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GoogleGenClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl CompletionClient for GoogleGenClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, InferenceError> {
        let api_request = GenerateContentRequest {
            contents: build_contents(&request),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                top_p: request.top_p,
                max_output_tokens: request.max_tokens,
            },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, request.model, self.api_key
        );

        let response = self
            .client
            .post(url)
            .timeout(request.timeout)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout
                } else {
                    InferenceError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_overflow_message(&body) {
                return Err(InferenceError::ContextOverflow);
            }
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    InferenceError::Unauthorized(format!("{status}"))
                }
                _ => InferenceError::Transport(format!("{status}: {body}")),
            });
        }

        let api_response: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;

        let candidate = api_response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::Malformed("no candidates in response".to_string()))?;

        let text: String = candidate
            .content
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(InferenceError::Malformed(
                "candidate carried no text parts".to_string(),
            ));
        }
        Ok(text)
    }
}

/// Re-encode the message list for a provider without a system role.
fn build_contents(request: &ChatRequest) -> Vec<Content> {
    request
        .messages
        .iter()
        .map(|msg| match msg.role {
            MessageRole::System => Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: Some(format!("[SYSTEM] {}", msg.content)),
                }],
            },
            MessageRole::User => Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: Some(msg.content.clone()),
                }],
            },
            MessageRole::Assistant => Content {
                role: "model".to_string(),
                parts: vec![Part {
                    text: Some(msg.content.clone()),
                }],
            },
        })
        .collect()
}

// =============================================================================
// API types
// =============================================================================

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}
