//! Text-completion service abstraction
//!
//! Provides a unified interface over completion providers:
//! - OpenAI-compatible chat completion endpoints (hosted or local)
//! - A deterministic echo client for offline runs and tests
//!
//! Every client handed to the pipeline is wrapped in a `ThrottledClient`,
//! which applies the process-wide concurrency cap, request rate and
//! rate-limit cooldown.

mod openai;
mod throttle;

pub use openai::OpenAiCompatibleClient;
pub use throttle::ThrottledClient;

use crate::config::CompletionConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One completion call: rendered prompts plus sampling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub seed: Option<u64>,
    /// Provider-specific body fields, passed through verbatim
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Text returned by the completion service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: Option<String>,
    pub model: String,
}

impl Completion {
    /// True when generation stopped at the output token limit
    pub fn truncated_by_length(&self) -> bool {
        matches!(self.finish_reason.as_deref(), Some("length") | Some("max_tokens"))
    }
}

/// Failure of a single completion call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompletionError {
    /// Rate limiting, timeouts, 5xx: worth retrying
    #[error("transient completion failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Non-retryable rejection of the request
    #[error("completion request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl CompletionError {
    pub fn transient(message: impl Into<String>) -> Self {
        CompletionError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CompletionError::Transient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CompletionError::Transient { retry_after, .. } => *retry_after,
            CompletionError::Rejected { .. } => None,
        }
    }
}

impl From<CompletionError> for AppError {
    fn from(err: CompletionError) -> Self {
        AppError::Completion {
            message: err.to_string(),
        }
    }
}

/// Trait for text completion
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Run one completion call; retries are the caller's concern
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, CompletionError>;

    /// Provider name for logs and metrics
    fn provider(&self) -> &str;
}

/// Rough token estimate used where the provider reports none
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Deterministic client for the `mock` provider.
///
/// Produces a summary line plus the first lines of the user prompt, so
/// outputs are stable across runs and depend only on the request.
pub struct EchoCompletionClient {
    max_chars: usize,
}

impl EchoCompletionClient {
    pub fn new() -> Self {
        Self { max_chars: 1200 }
    }
}

impl Default for EchoCompletionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionClient for EchoCompletionClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, CompletionError> {
        let body: String = request
            .user
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
            .chars()
            .take(self.max_chars)
            .collect();

        let headline: String = body.split_whitespace().take(12).collect::<Vec<_>>().join(" ");
        let text = format!("Summary: {}\n\n{}", headline, body);

        Ok(Completion {
            input_tokens: estimate_tokens(&request.system) + estimate_tokens(&request.user),
            output_tokens: estimate_tokens(&text),
            text,
            finish_reason: Some("stop".to_string()),
            model: request.model.clone(),
        })
    }

    fn provider(&self) -> &str {
        "mock"
    }
}

/// Create the throttled completion client selected by configuration
pub fn create_completion_client(config: &CompletionConfig) -> Result<Arc<dyn CompletionClient>> {
    let inner: Arc<dyn CompletionClient> = match config.provider.as_str() {
        "openai" => {
            if config.api_key.is_none() && config.api_base.is_none() {
                return Err(AppError::Configuration {
                    message: "completion.api_key is required for the openai provider".to_string(),
                });
            }
            Arc::new(OpenAiCompatibleClient::new(
                config.api_key.clone(),
                config.api_base.clone(),
                Duration::from_secs(config.timeout_secs),
            )?)
        }
        "mock" => Arc::new(EchoCompletionClient::new()),
        other => {
            return Err(AppError::Configuration {
                message: format!("unknown completion provider '{}'", other),
            })
        }
    };

    tracing::info!(
        provider = inner.provider(),
        max_concurrency = config.max_concurrency,
        requests_per_minute = config.requests_per_minute,
        "Completion client ready"
    );

    Ok(Arc::new(ThrottledClient::new(
        inner,
        config.max_concurrency,
        config.requests_per_minute,
    )?))
}
