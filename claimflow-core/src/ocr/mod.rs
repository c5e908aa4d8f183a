//! Document OCR.
//!
//! The `OcrEngine` trait turns an image or PDF on disk into text. Two engines exist:
//! - `MistralOcrClient` calls the hosted Mistral Document AI model
//! - `MockOcrEngine` replays canned text, for tests and offline runs
//!
//! `OcrEngine::extract_report` never fails: every error is folded into an
//! [`OcrReport`] with `status: "error"`, the JSON shape stored in `ocr_results/`.

pub mod mistral;

use crate::error::OcrError;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};

pub use mistral::MistralOcrClient;

/// File kinds understood by the OCR service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Jpeg,
    Png,
}

impl DocumentKind {
    /// Classify by extension. Unknown extensions are sent as PDF documents.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("jpg") | Some("jpeg") => Self::Jpeg,
            Some("png") => Self::Png,
            _ => Self::Pdf,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    /// Request field naming the document payload.
    pub fn url_type(self) -> &'static str {
        match self {
            Self::Pdf => "document_url",
            Self::Jpeg | Self::Png => "image_url",
        }
    }
}

/// Read a file and return `(data_url, url_type)` for the OCR request body.
pub fn encode_document(path: &Path) -> Result<(String, &'static str), OcrError> {
    let bytes = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            OcrError::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            OcrError::Unexpected {
                message: format!("Failed to read {}: {e}", path.display()),
            }
        }
    })?;
    let kind = DocumentKind::from_path(path);
    let data_url = format!("data:{};base64,{}", kind.mime_type(), BASE64.encode(bytes));
    Ok((data_url, kind.url_type()))
}

/// Text recovered from a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrText {
    pub text: String,
    pub pages: usize,
}

/// Outcome of an OCR call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrStatus {
    Success,
    Error,
}

/// Serializable OCR result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrReport {
    pub status: OcrStatus,
    #[serde(default)]
    pub text: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_processed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OcrReport {
    pub fn success(path: &Path, output: OcrText, model: &str) -> Self {
        Self {
            status: OcrStatus::Success,
            character_count: Some(output.text.chars().count()),
            text: output.text,
            file_path: path.display().to_string(),
            file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            pages_processed: Some(output.pages.max(1)),
            model_used: Some(model.to_string()),
            timestamp: Some(chrono::Local::now().to_rfc3339()),
            error: None,
        }
    }

    pub fn failure(path: &Path, err: &OcrError) -> Self {
        Self {
            status: OcrStatus::Error,
            text: String::new(),
            file_path: path.display().to_string(),
            file_name: None,
            character_count: None,
            pages_processed: None,
            model_used: None,
            timestamp: None,
            error: Some(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OcrStatus::Success
    }
}

/// Something that reads text out of documents.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Extract text from the file at `path`.
    async fn extract(&self, path: &Path) -> Result<OcrText, OcrError>;

    /// Model identifier reported in OCR results.
    fn model_name(&self) -> &str;

    /// Like [`extract`](Self::extract), with failures reported in-band.
    async fn extract_report(&self, path: &Path) -> OcrReport {
        info!(path = %path.display(), "Starting OCR");
        match self.extract(path).await {
            Ok(output) => {
                let report = OcrReport::success(path, output, self.model_name());
                info!(
                    path = %path.display(),
                    characters = report.character_count.unwrap_or(0),
                    "OCR completed"
                );
                report
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "OCR failed");
                OcrReport::failure(path, &e)
            }
        }
    }
}

/// Write `<stem>_ocr_result.json` into `dir`, creating it if needed.
pub fn save_report(report: &OcrReport, dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stem = Path::new(&report.file_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let out = dir.join(format!("{stem}_ocr_result.json"));
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&out, json)?;
    Ok(out)
}

/// OCR engine returning queued results, then a fallback text.
pub struct MockOcrEngine {
    responses: Mutex<Vec<Result<OcrText, OcrError>>>,
    fallback: String,
    calls: Mutex<Vec<PathBuf>>,
}

impl MockOcrEngine {
    pub fn new() -> Self {
        Self::with_text("")
    }

    /// An engine that answers every call with `text`.
    pub fn with_text(text: &str) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: text.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_text(&self, text: &str) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push(Ok(OcrText {
                text: text.to_string(),
                pages: 1,
            }));
        }
    }

    pub fn queue_error(&self, error: OcrError) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push(Err(error));
        }
    }

    /// Paths passed to `extract` so far.
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Default for MockOcrEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for MockOcrEngine {
    async fn extract(&self, path: &Path) -> Result<OcrText, OcrError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(path.to_path_buf());
        }
        if !path.exists() {
            return Err(OcrError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let queued = self.responses.lock().ok().and_then(|mut queue| {
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        });
        queued.unwrap_or_else(|| {
            Ok(OcrText {
                text: self.fallback.clone(),
                pages: 1,
            })
        })
    }

    fn model_name(&self) -> &str {
        "mock-ocr"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_document_kind_from_extension() {
        assert_eq!(DocumentKind::from_path(Path::new("a.JPG")), DocumentKind::Jpeg);
        assert_eq!(DocumentKind::from_path(Path::new("a.jpeg")), DocumentKind::Jpeg);
        assert_eq!(DocumentKind::from_path(Path::new("a.png")), DocumentKind::Png);
        assert_eq!(DocumentKind::from_path(Path::new("a.pdf")), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_path(Path::new("a.tiff")), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_path(Path::new("noext")), DocumentKind::Pdf);
    }

    #[test]
    fn test_encode_document_data_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crash1_front.jpeg");
        std::fs::write(&path, b"abc").unwrap();
        let (data_url, url_type) = encode_document(&path).unwrap();
        assert_eq!(data_url, "data:image/jpeg;base64,YWJj");
        assert_eq!(url_type, "image_url");

        let pdf = dir.path().join("policy.pdf");
        std::fs::write(&pdf, b"abc").unwrap();
        let (data_url, url_type) = encode_document(&pdf).unwrap();
        assert!(data_url.starts_with("data:application/pdf;base64,"));
        assert_eq!(url_type, "document_url");
    }

    #[test]
    fn test_encode_missing_file() {
        let err = encode_document(Path::new("/nonexistent/x.png")).unwrap_err();
        assert!(matches!(err, OcrError::FileNotFound { .. }));
    }

    #[test]
    fn test_success_report_fields() {
        let report = OcrReport::success(
            Path::new("/data/crash1_front.jpeg"),
            OcrText {
                text: "Policy ABC-123".into(),
                pages: 0,
            },
            "mistral-document-ai-2505",
        );
        assert!(report.is_success());
        assert_eq!(report.character_count, Some(14));
        assert_eq!(report.pages_processed, Some(1));
        assert_eq!(report.file_name.as_deref(), Some("crash1_front.jpeg"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "success");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_failure_report_shape() {
        let report = OcrReport::failure(Path::new("x.png"), &OcrError::NotConfigured);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["text"], "");
        assert_eq!(
            json["error"],
            "Mistral Document AI credentials not configured in environment"
        );
        assert_eq!(json["file_path"], "x.png");
    }

    #[test]
    fn test_save_report_file_name() {
        let dir = TempDir::new().unwrap();
        let report = OcrReport::success(
            Path::new("/in/crash2_back.png"),
            OcrText {
                text: "t".into(),
                pages: 1,
            },
            "m",
        );
        let out = save_report(&report, &dir.path().join("ocr_results")).unwrap();
        assert!(out.ends_with("ocr_results/crash2_back_ocr_result.json"));
        let loaded: OcrReport =
            serde_json::from_str(&std::fs::read_to_string(out).unwrap()).unwrap();
        assert_eq!(loaded, report);
    }

    #[tokio::test]
    async fn test_extract_report_folds_errors() {
        let engine = MockOcrEngine::with_text("hello");
        let report = engine.extract_report(Path::new("/missing/file.jpg")).await;
        assert_eq!(report.status, OcrStatus::Error);
        assert!(report.error.unwrap().contains("File not found"));
        assert_eq!(engine.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_engine_queue_then_fallback() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"x").unwrap();

        let engine = MockOcrEngine::with_text("fallback");
        engine.queue_text("first");
        engine.queue_error(OcrError::Request {
            message: "reset".into(),
        });
        assert_eq!(engine.extract(&path).await.unwrap().text, "first");
        assert!(engine.extract(&path).await.is_err());
        assert_eq!(engine.extract(&path).await.unwrap().text, "fallback");
    }
}
