//! Application configuration
//!
//! A single JSON document loaded once per session and passed explicitly;
//! there are no process-wide singletons. API keys may be supplied by the
//! environment when absent from the file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{CallSpec, CompletionClient, GoogleGenClient, OpenAiCompatClient};

/// Default models used when the config file leaves them unset.
const DEFAULT_MODEL: &str = "openrouter/auto";
const DEFAULT_UTILITY_MODEL: &str = "openrouter/auto-small";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {message}")]
    Unreadable { path: String, message: String },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Unknown service '{0}'")]
    UnknownService(String),

    #[error("Missing API key for service '{0}'")]
    MissingApiKey(String),
}

/// Which inference provider a tab talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    #[default]
    Openrouter,
    Google,
    Local,
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Service::Openrouter => "openrouter",
            Service::Google => "google",
            Service::Local => "local",
        };
        write!(f, "{s}")
    }
}

/// The recognized configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub current_service: Service,

    #[serde(default)]
    pub openrouter_api_key: Option<String>,
    #[serde(default = "default_openrouter_base_url")]
    pub openrouter_base_url: String,

    #[serde(default)]
    pub google_api_key: Option<String>,
    #[serde(default = "default_google_base_url")]
    pub google_base_url: String,

    #[serde(default = "default_local_base_url")]
    pub local_base_url: String,

    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_model")]
    pub default_cot_model: String,
    #[serde(default = "default_utility_model")]
    pub default_utility_model: String,
    /// Ordered fallback models tried on refusal or duplicate (at most 3)
    #[serde(default)]
    pub fallback_models: Vec<String>,

    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub setup_complete: bool,
}

fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_google_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_local_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_utility_model() -> String {
    DEFAULT_UTILITY_MODEL.to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_timeout_secs() -> u64 {
    180
}

impl Default for AppConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap_or_else(|_| unreachable!("empty config always parses"))
    }
}

impl AppConfig {
    /// Load and normalize the config document.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let mut config: AppConfig =
            serde_json::from_str(&text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.normalize();
        Ok(config)
    }

    /// Clamp ranges and fill API keys from the environment.
    pub fn normalize(&mut self) {
        self.default_temperature = self.default_temperature.clamp(0.0, 2.0);
        self.fallback_models.truncate(crate::llm::MAX_FALLBACK_MODELS);
        if self.openrouter_api_key.is_none() {
            self.openrouter_api_key = std::env::var("OPENROUTER_API_KEY").ok();
        }
        if self.google_api_key.is_none() {
            self.google_api_key = std::env::var("GOOGLE_API_KEY").ok();
        }
    }

    /// Build the provider client for the configured service.
    pub fn build_client(&self) -> Result<Arc<dyn CompletionClient>, ConfigError> {
        match self.current_service {
            Service::Openrouter => {
                let key = self
                    .openrouter_api_key
                    .clone()
                    .ok_or_else(|| ConfigError::MissingApiKey("openrouter".into()))?;
                Ok(Arc::new(OpenAiCompatClient::new(
                    &self.openrouter_base_url,
                    Some(key),
                )))
            }
            Service::Google => {
                let key = self
                    .google_api_key
                    .clone()
                    .ok_or_else(|| ConfigError::MissingApiKey("google".into()))?;
                Ok(Arc::new(GoogleGenClient::new(&self.google_base_url, key)))
            }
            // The local endpoint requires no auth.
            Service::Local => Ok(Arc::new(OpenAiCompatClient::new(&self.local_base_url, None))),
        }
    }

    /// The gateway call spec for a tab, with any per-tab overrides applied.
    pub fn call_spec(&self, overrides: &TabOverrides) -> CallSpec {
        let model = overrides
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let temperature = overrides
            .temperature
            .unwrap_or(self.default_temperature)
            .clamp(0.0, 2.0);
        CallSpec::new(model, self.default_utility_model.clone())
            .with_fallbacks(self.fallback_models.clone())
            .with_temperature(temperature)
            .with_max_tokens(self.default_max_tokens)
            .with_timeout(Duration::from_secs(self.request_timeout_secs))
    }
}

/// Per-tab configuration overrides.
///
/// Presentation settings ride along untouched; the core never interprets
/// them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabOverrides {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub cot_model: Option<String>,
    #[serde(default)]
    pub streaming_enabled: Option<bool>,
    #[serde(default)]
    pub streaming_speed: Option<f32>,
    /// Opaque presentation settings (theme, CRT effects, audio)
    #[serde(default)]
    pub presentation: serde_json::Value,
    /// Enable the intent-extraction utility call
    #[serde(default)]
    pub intent_extraction: bool,
    /// Enable pre- and post-validation
    #[serde(default)]
    pub validation: bool,
}

impl TabOverrides {
    pub fn from_workflow_settings(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}
