//! Mistral Document AI OCR client (Azure AI Foundry deployment).

use super::{OcrEngine, OcrText, encode_document};
use crate::config::OcrConfig;
use crate::error::OcrError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Number of response-body characters kept in HTTP error messages.
const ERROR_BODY_LIMIT: usize = 500;

/// Client for `<endpoint>/providers/mistral/azure/ocr`.
pub struct MistralOcrClient {
    client: Client,
    url: Option<String>,
    api_key: Option<String>,
    model: String,
}

impl MistralOcrClient {
    /// Build a client. Missing credentials are reported per request, not here.
    pub fn new(config: &OcrConfig) -> Result<Self, OcrError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OcrError::Unexpected {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        let (url, api_key) = match config.credentials() {
            Some((_, key)) => (config.ocr_url(), Some(key.to_string())),
            None => (None, None),
        };
        Ok(Self {
            client,
            url,
            api_key,
            model: config.model.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some() && self.api_key.is_some()
    }

    /// Pull the OCR text out of a response body.
    ///
    /// Checked in order: `pages[].markdown`, `content`, `text`,
    /// `choices[0].message.content`.
    pub fn extract_text(result: &Value) -> OcrText {
        if let Some(pages) = result.get("pages").and_then(|p| p.as_array()) {
            let parts: Vec<&str> = pages
                .iter()
                .filter_map(|page| page.get("markdown").and_then(|m| m.as_str()))
                .collect();
            debug!(pages = pages.len(), "Extracted markdown from pages");
            return OcrText {
                text: parts.join("\n\n"),
                pages: pages.len(),
            };
        }
        let text = if let Some(content) = result.get("content") {
            string_of(content)
        } else if let Some(text) = result.get("text") {
            string_of(text)
        } else if let Some(choice) = result
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        {
            choice
                .get("message")
                .and_then(|m| m.get("content"))
                .map(string_of)
                .unwrap_or_default()
        } else {
            let keys: Vec<&str> = result
                .as_object()
                .map(|o| o.keys().map(String::as_str).collect())
                .unwrap_or_default();
            warn!(keys = ?keys, "Unexpected response format from Mistral Document AI");
            String::new()
        };
        OcrText { text, pages: 0 }
    }
}

fn string_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

#[async_trait]
impl OcrEngine for MistralOcrClient {
    async fn extract(&self, path: &Path) -> Result<OcrText, OcrError> {
        if !path.exists() {
            return Err(OcrError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let (Some(url), Some(api_key)) = (self.url.as_deref(), self.api_key.as_deref()) else {
            return Err(OcrError::NotConfigured);
        };

        let (data_url, url_type) = encode_document(path)?;
        let payload = json!({
            "model": self.model,
            "document": {
                "type": url_type,
                url_type: data_url,
            }
        });

        info!(endpoint = %url, model = %self.model, "Submitting document to Mistral Document AI");
        let response = self
            .client
            .post(url)
            .header("api-key", api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| OcrError::Request {
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| OcrError::Request {
            message: e.to_string(),
        })?;
        debug!(status = status.as_u16(), length = body.len(), "OCR response received");

        if !status.is_success() {
            return Err(OcrError::HttpStatus {
                status: status.as_u16(),
                body: truncate_chars(&body, ERROR_BODY_LIMIT),
            });
        }

        let result: Value = serde_json::from_str(&body).map_err(|e| OcrError::Unexpected {
            message: format!("Invalid JSON from OCR service: {e}"),
        })?;
        Ok(Self::extract_text(&result))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
