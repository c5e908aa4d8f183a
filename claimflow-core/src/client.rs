//! Client for a running Claims Processing API, plus the end-to-end acceptance check.

use crate::config::ClientConfig;
use crate::error::ClientError;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Status code and JSON body of one API call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiReply {
    pub status: u16,
    pub body: Value,
}

/// HTTP client for the claims API.
pub struct ApiClient {
    client: Client,
    base_url: String,
    health_timeout: Duration,
    upload_timeout: Duration,
}

impl ApiClient {
    /// A client for `api_url` with the default 10 s health and 60 s upload timeouts.
    pub fn new(api_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: api_url.trim_end_matches('/').to_string(),
            health_timeout: Duration::from_secs(10),
            upload_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(&config.api_url).with_timeouts(
            Duration::from_secs(config.health_timeout_secs),
            Duration::from_secs(config.upload_timeout_secs),
        )
    }

    pub fn with_timeouts(mut self, health: Duration, upload: Duration) -> Self {
        self.health_timeout = health;
        self.upload_timeout = upload;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health`.
    pub async fn health(&self) -> Result<ApiReply, ClientError> {
        let url = format!("{}/health", self.base_url);
        info!(url = %url, "Testing health endpoint");
        let response = self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        read_reply(&url, response).await
    }

    /// `POST /process-claim/upload` with the image as multipart field `file`.
    pub async fn upload(&self, image: &Path) -> Result<ApiReply, ClientError> {
        if !image.exists() {
            return Err(ClientError::ImageNotFound {
                path: image.to_path_buf(),
            });
        }
        let url = format!("{}/process-claim/upload", self.base_url);
        let bytes = tokio::fs::read(image).await.map_err(|e| ClientError::Request {
            url: url.clone(),
            message: format!("Failed to read {}: {e}", image.display()),
        })?;
        let file_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "claim_image.jpg".to_string());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(image))
            .map_err(|e| request_error(&url, e))?;
        let form = Form::new().part("file", part);

        info!(url = %url, image = %image.display(), "Testing file upload");
        let response = self
            .client
            .post(&url)
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        read_reply(&url, response).await
    }

    /// Health check followed by an upload of `image`.
    pub async fn acceptance(&self, image: &Path) -> Result<AcceptanceReport, ClientError> {
        info!(api_url = %self.base_url, "Testing Claims Processing API");
        let health = self.health().await?;
        if !image.exists() {
            return Err(ClientError::ImageNotFound {
                path: image.to_path_buf(),
            });
        }
        let upload = self.upload(image).await?;
        Ok(AcceptanceReport {
            api_url: self.base_url.clone(),
            health,
            upload,
        })
    }
}

/// Run the acceptance check against `api_url` with default timeouts.
pub async fn run_acceptance(api_url: &str, image: &Path) -> Result<AcceptanceReport, ClientError> {
    ApiClient::new(api_url).acceptance(image).await
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn request_error(url: &str, err: reqwest::Error) -> ClientError {
    ClientError::Request {
        url: url.to_string(),
        message: err.to_string(),
    }
}

async fn read_reply(url: &str, response: reqwest::Response) -> Result<ApiReply, ClientError> {
    let status = response.status().as_u16();
    let text = response.text().await.map_err(|e| request_error(url, e))?;
    let body = serde_json::from_str(&text).map_err(|e| ClientError::InvalidBody {
        url: url.to_string(),
        message: format!("{e} (status {status})"),
    })?;
    Ok(ApiReply { status, body })
}

/// What the acceptance check observed.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptanceReport {
    pub api_url: String,
    pub health: ApiReply,
    pub upload: ApiReply,
}

impl AcceptanceReport {
    pub fn is_healthy(&self) -> bool {
        self.health.status == 200 && self.health.body["status"] == "healthy"
    }

    pub fn success(&self) -> bool {
        self.upload.body["success"] == true
    }

    /// `data.vehicle_info`, when it is a non-empty object.
    pub fn vehicle_info(&self) -> Option<&Map<String, Value>> {
        self.upload.body["data"]["vehicle_info"]
            .as_object()
            .filter(|o| !o.is_empty())
    }

    pub fn ocr_characters(&self) -> Option<u64> {
        self.upload.body["data"]["metadata"]["ocr_characters"].as_u64()
    }

    /// The envelope's `error`, or a 500's `detail`.
    pub fn error(&self) -> Option<&str> {
        self.upload.body["error"]
            .as_str()
            .or_else(|| self.upload.body["detail"].as_str())
    }

    /// Reasons the check failed; empty when it passed.
    pub fn failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if !self.is_healthy() {
            failures.push(format!(
                "health check returned {} with status {}",
                self.health.status, self.health.body["status"]
            ));
        }
        if self.upload.status != 200 {
            failures.push(format!("upload returned HTTP {}", self.upload.status));
        }
        if !self.success() {
            failures.push(format!(
                "upload reported success=false ({})",
                self.error().unwrap_or("no error message")
            ));
        }
        if self.vehicle_info().is_none() {
            failures.push("data.vehicle_info is missing or empty".to_string());
        }
        failures
    }

    pub fn passed(&self) -> bool {
        self.failures().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(health: Value, upload_status: u16, upload: Value) -> AcceptanceReport {
        AcceptanceReport {
            api_url: "http://localhost:8080".into(),
            health: ApiReply {
                status: 200,
                body: health,
            },
            upload: ApiReply {
                status: upload_status,
                body: upload,
            },
        }
    }

    fn healthy() -> Value {
        json!({"status": "healthy", "service": "Claims Processing API", "version": "1.0.0"})
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        assert_eq!(
            ApiClient::new("https://claims.example.io//").base_url(),
            "https://claims.example.io"
        );
    }

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for(Path::new("a.JPEG")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a.png")), "image/png");
        assert_eq!(mime_for(Path::new("a")), "application/octet-stream");
    }

    #[test]
    fn test_passing_report() {
        let r = report(
            healthy(),
            200,
            json!({
                "success": true,
                "data": {
                    "vehicle_info": {"make": "Toyota"},
                    "metadata": {"ocr_characters": 412}
                },
                "error": null
            }),
        );
        assert!(r.passed());
        assert_eq!(r.ocr_characters(), Some(412));
        assert_eq!(r.error(), None);
    }

    #[test]
    fn test_empty_vehicle_info_fails() {
        let r = report(
            healthy(),
            200,
            json!({"success": true, "data": {"vehicle_info": {}}}),
        );
        assert!(!r.passed());
        assert_eq!(r.failures(), vec!["data.vehicle_info is missing or empty"]);
    }

    #[test]
    fn test_failed_claim_surfaces_error() {
        let r = report(
            healthy(),
            200,
            json!({"success": false, "data": {"error": "OCR processing failed"}, "error": "OCR processing failed"}),
        );
        assert!(!r.passed());
        assert_eq!(r.error(), Some("OCR processing failed"));
        assert_eq!(r.failures().len(), 2);
    }

    #[test]
    fn test_server_error_detail() {
        let r = report(json!({"status": "degraded"}), 500, json!({"detail": "boom"}));
        assert!(!r.is_healthy());
        assert_eq!(r.error(), Some("boom"));
        assert_eq!(r.failures().len(), 4);
    }

    #[tokio::test]
    async fn test_upload_missing_image() {
        let client = ApiClient::new("http://127.0.0.1:9");
        let err = client
            .upload(Path::new("/nonexistent/crash1_front.jpeg"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ImageNotFound { .. }));
        assert!(err.to_string().starts_with("Test image not found"));
    }
}
