//! OpenAI-compatible chat completion client

use super::{Completion, CompletionClient, CompletionError, CompletionRequest};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Longest server-requested pause honoured from a `Retry-After` header
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Client for any endpoint speaking the `/chat/completions` protocol
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiCompatibleClient {
    /// Create a new client
    pub fn new(api_key: Option<String>, base_url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }

    /// Resolve the chat completions endpoint from the base URL
    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }

    fn body(request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": [
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user", content: &request.user },
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens,
        });

        if let Some(obj) = body.as_object_mut() {
            if let Some(top_p) = request.top_p {
                obj.insert("top_p".to_string(), top_p.into());
            }
            if let Some(top_k) = request.top_k {
                obj.insert("top_k".to_string(), top_k.into());
            }
            if let Some(seed) = request.seed {
                obj.insert("seed".to_string(), seed.into());
            }
            for (key, value) in &request.extra {
                obj.insert(key.clone(), value.clone());
            }
        }
        body
    }
}

/// Parse a `Retry-After` header given in delta-seconds, capped at
/// [`MAX_RETRY_AFTER`]
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()?;
    let delay = match Duration::try_from_secs_f64(secs) {
        Ok(delay) => delay,
        // finite but too large to represent
        Err(_) if secs.is_finite() && secs > 0.0 => MAX_RETRY_AFTER,
        Err(_) => return None,
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

fn classify_status(status: StatusCode, headers: &HeaderMap, body: String) -> CompletionError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        CompletionError::Transient {
            message: format!("API error {}: {}", status, body),
            retry_after: parse_retry_after(headers),
        }
    } else {
        CompletionError::Rejected {
            status: status.as_u16(),
            message: body,
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, CompletionError> {
        let mut req = self.client.post(self.endpoint()).json(&Self::body(request));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| CompletionError::transient(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::transient(format!("Failed to parse response: {}", e)))?;

        let usage = parsed.usage.unwrap_or(ChatUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });
        let choice = parsed.choices.into_iter().next();
        let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
        let text = choice.and_then(|c| c.message.content).unwrap_or_default();

        Ok(Completion {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            finish_reason,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
        })
    }

    fn provider(&self) -> &str {
        "openai"
    }
}
