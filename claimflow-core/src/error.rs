//! Error types for the Claimflow core library.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering OCR, LLM, structuring, configuration, API client, and deployment domains.

use std::path::PathBuf;

/// Top-level error type for the Claimflow core library.
#[derive(Debug, thiserror::Error)]
pub enum ClaimflowError {
    #[error("OCR error: {0}")]
    Ocr(#[from] OcrError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Structuring error: {0}")]
    Structuring(#[from] StructuringError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("API client error: {0}")]
    Client(#[from] ClientError),

    #[error("Deployment error: {0}")]
    Deploy(#[from] DeployError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the hosted OCR service.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Mistral Document AI credentials not configured in environment")]
    NotConfigured,

    #[error("HTTP Error {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Request failed: {message}")]
    Request { message: String },

    #[error("Unexpected error: {message}")]
    Unexpected { message: String },
}

/// Errors from LLM provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Credential unavailable: {message}")]
    Credential { message: String },
}

/// Errors from turning OCR text into claim JSON.
#[derive(Debug, thiserror::Error)]
pub enum StructuringError {
    #[error("JSON parsing failed: {message}")]
    InvalidJson { message: String, raw_response: String },

    #[error("Model returned JSON that is not an object")]
    NotAnObject { raw_response: String },

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

/// Errors from the claims API client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Test image not found: {path}")]
    ImageNotFound { path: PathBuf },

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Response from {url} was not JSON: {message}")]
    InvalidBody { url: String, message: String },
}

/// Errors from the container deployment driver.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Environment file not found: {path}")]
    EnvFileMissing { path: PathBuf },

    #[error("Container Apps environment '{environment}' not found in resource group '{resource_group}'")]
    EnvironmentMissing {
        environment: String,
        resource_group: String,
    },

    #[error("Step '{step}' failed (exit {code}): {stderr}")]
    StepFailed {
        step: String,
        code: i32,
        stderr: String,
    },

    #[error("Failed to launch '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("Invalid environment file {path}: {message}")]
    EnvFileInvalid { path: PathBuf, message: String },
}

/// A type alias for results using the top-level `ClaimflowError`.
pub type Result<T> = std::result::Result<T, ClaimflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_ocr() {
        let err = ClaimflowError::Ocr(OcrError::HttpStatus {
            status: 401,
            body: "unauthorized".into(),
        });
        assert_eq!(err.to_string(), "OCR error: HTTP Error 401: unauthorized");
    }

    #[test]
    fn test_ocr_not_configured_message() {
        assert_eq!(
            OcrError::NotConfigured.to_string(),
            "Mistral Document AI credentials not configured in environment"
        );
    }

    #[test]
    fn test_error_display_llm() {
        let err = ClaimflowError::Llm(LlmError::ApiRequest {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "LLM error: API request failed: connection refused"
        );
    }

    #[test]
    fn test_structuring_wraps_llm_transparently() {
        let err: StructuringError = LlmError::RateLimited {
            retry_after_secs: 7,
        }
        .into();
        assert_eq!(err.to_string(), "Rate limited by provider, retry after 7s");
    }

    #[test]
    fn test_error_display_deploy() {
        let err = ClaimflowError::Deploy(DeployError::EnvFileMissing {
            path: PathBuf::from(".env"),
        });
        assert_eq!(
            err.to_string(),
            "Deployment error: Environment file not found: .env"
        );

        let err = DeployError::StepFailed {
            step: "docker push".into(),
            code: 1,
            stderr: "denied".into(),
        };
        assert_eq!(err.to_string(), "Step 'docker push' failed (exit 1): denied");
    }

    #[test]
    fn test_error_display_config() {
        let err = ClaimflowError::Config(ConfigError::MissingField {
            field: "deploy.resource_group".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required field: deploy.resource_group"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ClaimflowError = io_err.into();
        assert!(matches!(err, ClaimflowError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: ClaimflowError = serde_err.into();
        assert!(matches!(err, ClaimflowError::Serialization(_)));
    }
}
