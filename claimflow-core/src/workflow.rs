//! The claim-processing workflow: OCR first, then JSON structuring.

use crate::config::ClaimflowConfig;
use crate::error::{ClaimflowError, StructuringError};
use crate::ocr::{MistralOcrClient, OcrEngine};
use crate::providers::create_provider;
use crate::structuring::{JsonStructurer, SchemaProfile};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

fn parse_failure(details: &str, raw_response: String) -> Value {
    error!(error = %details, "Failed to parse JSON");
    json!({
        "error": "JSON parsing failed",
        "details": details,
        "raw_response": raw_response,
    })
}

/// Sequential OCR → structuring pipeline.
pub struct ClaimWorkflow {
    ocr: Arc<dyn OcrEngine>,
    structurer: JsonStructurer,
}

impl ClaimWorkflow {
    pub fn new(ocr: Arc<dyn OcrEngine>, structurer: JsonStructurer) -> Self {
        Self { ocr, structurer }
    }

    /// Wire the Mistral OCR client and the Azure OpenAI provider from configuration.
    pub fn from_config(config: &ClaimflowConfig) -> Result<Self, ClaimflowError> {
        let ocr = Arc::new(MistralOcrClient::new(&config.ocr)?);
        let provider = create_provider(&config.llm, &config.retry)?;
        let structurer = JsonStructurer::new(provider)
            .with_temperature(config.llm.temperature)
            .with_max_tokens(config.llm.max_tokens);
        Ok(Self::new(ocr, structurer))
    }

    /// Process one claim image.
    ///
    /// OCR failures and unparseable model output come back as `Ok` values carrying an
    /// `error` key. Provider failures (auth, transport) are returned as `Err`.
    pub async fn process(&self, image_path: &Path) -> Result<Value, ClaimflowError> {
        info!(path = %image_path.display(), "Starting claims processing workflow");

        let report = self.ocr.extract_report(image_path).await;
        if !report.is_success() {
            error!(error = ?report.error, "OCR failed");
            return Ok(json!({
                "error": "OCR processing failed",
                "details": report.error,
                "image_path": image_path.display().to_string(),
            }));
        }
        let ocr_characters = report.text.chars().count();
        info!(characters = ocr_characters, "OCR step extracted text");

        let mut structured = match self
            .structurer
            .structure(&report.text, None, SchemaProfile::Summary)
            .await
        {
            Ok(value) => value,
            Err(StructuringError::InvalidJson {
                message,
                raw_response,
            }) => return Ok(parse_failure(&message, raw_response)),
            Err(StructuringError::NotAnObject { raw_response }) => {
                return Ok(parse_failure(
                    "model returned JSON that is not an object",
                    raw_response,
                ));
            }
            Err(e) => return Err(e.into()),
        };

        if let Value::Object(map) = &mut structured {
            map.insert(
                "metadata".to_string(),
                json!({
                    "source_image": image_path.display().to_string(),
                    "ocr_characters": ocr_characters,
                    "workflow": "multi-agent",
                }),
            );
        }
        info!("Successfully structured OCR text into JSON");
        Ok(structured)
    }
}
