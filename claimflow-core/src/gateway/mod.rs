//! # Claims Processing API
//!
//! HTTP front door for the claim workflow. Accepts claim images either as a
//! multipart upload or as base64 JSON, runs OCR and structuring, and answers with
//! a `{success, data, error}` envelope.

mod server;

pub use server::{AppState, router, run};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SERVICE_NAME: &str = "Claims Processing API";
pub const SERVICE_VERSION: &str = "1.0.0";

/// Body of `GET /` and `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            service: SERVICE_NAME.to_string(),
            version: SERVICE_VERSION.to_string(),
        }
    }
}

/// Body of `POST /process-claim/base64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimProcessRequest {
    pub image_base64: String,
    #[serde(default = "default_filename")]
    pub filename: String,
}

fn default_filename() -> String {
    "claim_image.jpg".to_string()
}

/// Response envelope for both processing routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimProcessResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ClaimProcessResponse {
    /// Wrap a workflow result. A top-level `error` key marks the claim as failed.
    pub fn from_result(result: Value) -> Self {
        match result.get("error") {
            Some(err) => {
                let error = match err {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Self {
                    success: false,
                    error: Some(error),
                    data: Some(result),
                }
            }
            None => Self {
                success: true,
                data: Some(result),
                error: None,
            },
        }
    }
}
