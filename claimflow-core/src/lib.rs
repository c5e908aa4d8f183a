//! # Claimflow Core
//!
//! Core library for Claimflow, an insurance claim intake pipeline.
//! Provides the OCR client, the LLM structuring agent, the claim workflow,
//! the Claims Processing API, its acceptance client, batch statement
//! processing, the Container Apps deployment driver, and configuration.

pub mod client;
pub mod config;
pub mod credentials;
pub mod deploy;
pub mod error;
pub mod gateway;
pub mod ocr;
pub mod providers;
pub mod statements;
pub mod structuring;
pub mod types;
pub mod workflow;

// Re-export commonly used types at the crate root.
pub use client::{AcceptanceReport, ApiClient, run_acceptance};
pub use config::{ClaimflowConfig, load_config};
pub use error::{ClaimflowError, Result};
pub use ocr::{MistralOcrClient, MockOcrEngine, OcrEngine, OcrReport};
pub use providers::{LlmProvider, MockLlmProvider};
pub use structuring::{JsonStructurer, SchemaProfile, VehicleSide};
pub use types::{CompletionRequest, CompletionResponse, Message, Role, TokenUsage};
pub use workflow::ClaimWorkflow;
