//! Azure OpenAI chat-completions provider.
//!
//! Talks to a model deployment on an Azure OpenAI or AI Foundry resource using the
//! `/openai/deployments/{deployment}/chat/completions` route. Authentication comes from a
//! [`TokenSource`]: an `api-key` header or an Entra ID bearer token.

use super::{LlmProvider, with_retry};
use crate::config::{LlmConfig, RetryConfig};
use crate::credentials::TokenSource;
use crate::error::LlmError;
use crate::types::{CompletionRequest, CompletionResponse, TokenUsage};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Azure OpenAI chat deployment client.
pub struct AzureOpenAiProvider {
    client: Client,
    endpoint: Option<String>,
    deployment: String,
    api_version: String,
    timeout_secs: u64,
    retry: RetryConfig,
    credentials: Arc<dyn TokenSource>,
}

impl AzureOpenAiProvider {
    /// Create a provider from configuration and a credential source.
    ///
    /// A missing endpoint is reported when a completion is requested, not here.
    pub fn new(
        config: &LlmConfig,
        retry: RetryConfig,
        credentials: Arc<dyn TokenSource>,
    ) -> Result<Self, LlmError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .map(Self::normalize_endpoint);

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Connection {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            endpoint,
            deployment: config.deployment.clone(),
            api_version: config.api_version.clone(),
            timeout_secs: config.timeout_secs,
            retry,
            credentials,
        })
    }

    /// Reduce an AI Foundry project endpoint (`.../api/projects/<name>`) to its resource root.
    fn normalize_endpoint(endpoint: &str) -> String {
        let trimmed = endpoint.trim().trim_end_matches('/');
        match trimmed.find("/api/projects") {
            Some(idx) => trimmed[..idx].to_string(),
            None => trimmed.to_string(),
        }
    }

    fn completions_url(&self) -> Result<String, LlmError> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| LlmError::ApiRequest {
            message: "llm.endpoint is not configured".to_string(),
        })?;
        Ok(format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint, self.deployment, self.api_version
        ))
    }

    fn build_body(request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
            .collect();
        let mut body = json!({
            "messages": messages,
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    /// Parse a chat-completions response body.
    fn parse_response(body: &Value, model: &str) -> Result<CompletionResponse, LlmError> {
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No choices in response".to_string(),
            })?;

        let finish_reason = choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .map(|s| s.to_string());

        let text = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str());
        let text = match (text, finish_reason.as_deref()) {
            (Some(t), _) => t.to_string(),
            (None, Some("content_filter")) => {
                return Err(LlmError::ResponseParse {
                    message: "Response blocked by content filter".to_string(),
                });
            }
            (None, _) => String::new(),
        };

        let usage_obj = body.get("usage");
        let usage = TokenUsage {
            input_tokens: usage_obj
                .and_then(|u| u.get("prompt_tokens"))
                .and_then(|t| t.as_u64())
                .unwrap_or(0) as usize,
            output_tokens: usage_obj
                .and_then(|u| u.get("completion_tokens"))
                .and_then(|t| t.as_u64())
                .unwrap_or(0) as usize,
        };

        let model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string();

        Ok(CompletionResponse {
            text,
            usage,
            model,
            finish_reason,
        })
    }

    /// Map an HTTP status code to the appropriate LlmError.
    fn map_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => {
                debug!(body = %body, "Authentication failed ({})", status);
                LlmError::AuthFailed {
                    provider: "azure-openai".to_string(),
                }
            }
            429 => {
                // "Requests ... Please retry after 6 seconds."
                let retry_secs = body
                    .split("retry after ")
                    .nth(1)
                    .and_then(|rest| rest.split_whitespace().next())
                    .and_then(|n| n.parse::<u64>().ok())
                    .unwrap_or(5);
                LlmError::RateLimited {
                    retry_after_secs: retry_secs,
                }
            }
            status if status >= 500 => LlmError::ApiRequest {
                message: format!("Server error ({status}): {body}"),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {status}: {body}"),
            },
        }
    }

    async fn send_once(&self, body: &Value) -> Result<CompletionResponse, LlmError> {
        let url = self.completions_url()?;
        let credential = self.credentials.credential().await?;
        debug!(url = %url, deployment = %self.deployment, "Sending chat completion request");

        let response = credential
            .apply(self.client.post(&url))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_secs: self.timeout_secs,
                    }
                } else if e.is_connect() {
                    LlmError::Connection {
                        message: e.to_string(),
                    }
                } else {
                    LlmError::ApiRequest {
                        message: format!("Request failed: {e}"),
                    }
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {e}"),
        })?;
        if !status.is_success() {
            return Err(Self::map_http_error(status, &text));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
            message: format!("Invalid JSON: {e}"),
        })?;
        Self::parse_response(&json, &self.deployment)
    }
}

#[async_trait]
impl LlmProvider for AzureOpenAiProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = Self::build_body(&request);
        let body = &body;
        let this = self;
        with_retry(&self.retry, move || this.send_once(body)).await
    }

    fn model_name(&self) -> &str {
        &self.deployment
    }
}
