//! JSON structuring agent.
//!
//! Sends OCR text to the chat model with schema instructions and parses the answer
//! into a JSON object. Two schema profiles exist: the detailed claim schema (with
//! front/back vehicle blocks) and the compact summary used by the claim workflow.

pub mod prompts;

use crate::error::{ClaimflowError, StructuringError};
use crate::ocr::OcrReport;
use crate::providers::LlmProvider;
use crate::types::{CompletionRequest, Message};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Side of the vehicle shown in a damage photo, inferred from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleSide {
    Front,
    Back,
    Unspecified,
}

impl VehicleSide {
    /// `front` wins over `back` when both appear.
    pub fn detect(file_name: &str) -> Self {
        let base = Path::new(file_name)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| file_name.to_lowercase());
        if base.contains("front") {
            Self::Front
        } else if base.contains("back") {
            Self::Back
        } else {
            Self::Unspecified
        }
    }

    pub fn as_str(self) -> Option<&'static str> {
        match self {
            Self::Front => Some("front"),
            Self::Back => Some("back"),
            Self::Unspecified => None,
        }
    }
}

impl std::fmt::Display for VehicleSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str().unwrap_or("unspecified"))
    }
}

/// Which output schema the agent is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaProfile {
    /// Full claim document schema with side-specific damage fields.
    #[default]
    Detailed,
    /// `vehicle_info`, `damage_assessment` and `incident_info` only.
    Summary,
}

/// Cut a fenced model answer down to the JSON object inside it.
pub fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();
    if trimmed.starts_with("```")
        && let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        return &trimmed[start..=end];
    }
    trimmed
}

/// Parse model output into a JSON object.
pub fn parse_structured(response: &str) -> Result<Map<String, Value>, StructuringError> {
    let candidate = extract_json(response);
    let value: Value =
        serde_json::from_str(candidate).map_err(|e| StructuringError::InvalidJson {
            message: e.to_string(),
            raw_response: candidate.to_string(),
        })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(StructuringError::NotAnObject {
            raw_response: candidate.to_string(),
        }),
    }
}

fn now_iso() -> String {
    chrono::Local::now().to_rfc3339()
}

/// LLM-backed converter from OCR text to claim JSON.
pub struct JsonStructurer {
    provider: Arc<dyn LlmProvider>,
    temperature: f32,
    max_tokens: Option<usize>,
}

impl JsonStructurer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            temperature: 0.1,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Structure `ocr_text` into a JSON object.
    ///
    /// With [`SchemaProfile::Detailed`] the vehicle side is taken from `source_file`
    /// and a `metadata` block is attached to the result.
    pub async fn structure(
        &self,
        ocr_text: &str,
        source_file: Option<&str>,
        profile: SchemaProfile,
    ) -> Result<Value, StructuringError> {
        let side = match profile {
            SchemaProfile::Detailed => source_file
                .map(VehicleSide::detect)
                .unwrap_or(VehicleSide::Unspecified),
            SchemaProfile::Summary => VehicleSide::Unspecified,
        };
        info!(vehicle_side = %side, profile = ?profile, "Sending OCR text to structuring agent");

        let request = CompletionRequest {
            messages: vec![
                Message::system(prompts::instructions(profile, side)),
                Message::user(prompts::user_query(ocr_text, side)),
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let response = self.provider.complete(request).await?;
        let mut structured = parse_structured(&response.text)?;

        if profile == SchemaProfile::Detailed {
            structured.insert(
                "metadata".to_string(),
                json!({
                    "source_file": source_file.unwrap_or("unknown"),
                    "detected_vehicle_side": side.as_str(),
                    "processing_timestamp": now_iso(),
                    "agent_model": self.provider.model_name(),
                    "original_text_length": ocr_text.chars().count(),
                }),
            );
        }
        info!(tokens = response.usage.total(), "Structured OCR text into JSON");
        Ok(Value::Object(structured))
    }

    /// Structure a saved OCR result, reporting every failure in-band.
    pub async fn structure_ocr_report(&self, report: &OcrReport) -> Value {
        let source_file = report.file_path.as_str();
        if !report.is_success() {
            return json!({
                "error": "OCR processing failed",
                "ocr_error": report.error.as_deref().unwrap_or("Unknown error"),
                "metadata": {
                    "source_file": source_file,
                    "processing_timestamp": now_iso(),
                }
            });
        }
        if report.text.is_empty() {
            return json!({
                "error": "No text extracted from OCR",
                "metadata": {
                    "source_file": source_file,
                    "processing_timestamp": now_iso(),
                }
            });
        }

        match self
            .structure(&report.text, Some(source_file), SchemaProfile::Detailed)
            .await
        {
            Ok(value) => value,
            Err(StructuringError::InvalidJson {
                message,
                raw_response,
            }) => {
                error!(error = %message, "Failed to parse agent response as JSON");
                json!({
                    "error": "JSON parsing failed",
                    "error_details": message,
                    "raw_response": raw_response,
                    "metadata": {
                        "source_file": source_file,
                        "processing_timestamp": now_iso(),
                        "agent_model": self.provider.model_name(),
                    }
                })
            }
            Err(e) => {
                error!(error = %e, "Error in JSON structuring");
                json!({
                    "error": "Processing failed",
                    "error_details": e.to_string(),
                    "metadata": {
                        "source_file": source_file,
                        "processing_timestamp": now_iso(),
                    }
                })
            }
        }
    }
}

/// Contents of a file handed to `claimflow structure`.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuringInput {
    /// A saved OCR result (`*_ocr_result.json`).
    Ocr(OcrReport),
    /// Anything else, used verbatim as OCR text.
    RawText(String),
}

impl StructuringInput {
    pub fn is_ocr_result(&self) -> bool {
        matches!(self, Self::Ocr(_))
    }

    /// Turn the input into an OCR report, treating raw text as a successful OCR of `path`.
    pub fn into_report(self, path: &Path) -> OcrReport {
        match self {
            Self::Ocr(report) => report,
            Self::RawText(text) => OcrReport::success(
                path,
                crate::ocr::OcrText { text, pages: 1 },
                "raw-text",
            ),
        }
    }
}

/// Read a structuring input file.
///
/// JSON with both `text` and `status` keys is an OCR result; everything else,
/// JSON or not, is raw text.
pub fn load_structuring_input(path: &Path) -> Result<StructuringInput, ClaimflowError> {
    let content = std::fs::read_to_string(path)?;
    if let Ok(value) = serde_json::from_str::<Value>(&content)
        && value.get("text").is_some()
        && value.get("status").is_some()
        && let Ok(report) = serde_json::from_value::<OcrReport>(value)
    {
        return Ok(StructuringInput::Ocr(report));
    }
    Ok(StructuringInput::RawText(content))
}

/// `claims/crash1_front_ocr_result.json` → `claims/crash1_front_ocr_result_structured.json`.
pub fn structured_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{stem}_structured.json"))
}
