//! Configuration system for Claimflow.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/claimflow/config.toml` and/or `.claimflow/config.toml`
//! in the workspace directory. The environment variable names used by the hackathon
//! material (`MISTRAL_DOCUMENT_AI_ENDPOINT`, `MODEL_DEPLOYMENT_NAME`, `PORT`, ...) are
//! honored as well, below the `CLAIMFLOW_` prefixed variables.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Placeholder shown instead of secrets in `config show`.
pub const REDACTED: &str = "********";

/// Environment variables from the hackathon `.env` files and the config keys they feed.
pub const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("MISTRAL_DOCUMENT_AI_ENDPOINT", "ocr.endpoint"),
    ("MISTRAL_DOCUMENT_AI_KEY", "ocr.api_key"),
    ("MISTRAL_DOCUMENT_AI_DEPLOYMENT_NAME", "ocr.model"),
    ("AZURE_OPENAI_ENDPOINT", "llm.endpoint"),
    ("AI_FOUNDRY_PROJECT_ENDPOINT", "llm.endpoint"),
    ("AZURE_OPENAI_API_KEY", "llm.api_key"),
    ("MODEL_DEPLOYMENT_NAME", "llm.deployment"),
    ("PORT", "server.port"),
    ("API_URL", "client.api_url"),
];

/// Top-level configuration for Claimflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimflowConfig {
    pub ocr: OcrConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub statements: StatementsConfig,
    pub deploy: DeployConfig,
    pub retry: RetryConfig,
}

impl ClaimflowConfig {
    /// A copy with every secret replaced by [`REDACTED`].
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.ocr.api_key.is_some() {
            copy.ocr.api_key = Some(REDACTED.to_string());
        }
        if copy.llm.api_key.is_some() {
            copy.llm.api_key = Some(REDACTED.to_string());
        }
        copy
    }

    /// Collect warnings from every section.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.ocr.validate();
        warnings.extend(self.llm.validate());
        warnings.extend(self.server.validate());
        warnings
    }
}

/// Mistral Document AI (hosted OCR) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Resource endpoint, e.g. `https://<resource>.services.ai.azure.com`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Key sent in the `api-key` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Model deployment name.
    pub model: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "mistral-document-ai-2505".to_string(),
            timeout_secs: 300,
        }
    }
}

impl OcrConfig {
    /// Endpoint and key, if both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let endpoint = self.endpoint.as_deref().filter(|s| !s.trim().is_empty())?;
        let key = self.api_key.as_deref().filter(|s| !s.trim().is_empty())?;
        Some((endpoint, key))
    }

    /// Full URL of the OCR route.
    pub fn ocr_url(&self) -> Option<String> {
        self.endpoint
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|e| format!("{}/providers/mistral/azure/ocr", e.trim_end_matches('/')))
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        match self.endpoint.as_deref() {
            None | Some("") => warnings.push(
                "ocr.endpoint is not set (MISTRAL_DOCUMENT_AI_ENDPOINT); OCR requests will fail"
                    .to_string(),
            ),
            Some(e) if url::Url::parse(e).is_err() => {
                warnings.push(format!("ocr.endpoint '{e}' is not a valid URL"))
            }
            _ => {}
        }
        if self.api_key.as_deref().is_none_or(str::is_empty) {
            warnings.push(
                "ocr.api_key is not set (MISTRAL_DOCUMENT_AI_KEY); OCR requests will fail"
                    .to_string(),
            );
        }
        warnings
    }
}

/// Azure OpenAI chat deployment used by the structuring agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Azure OpenAI or AI Foundry resource endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Optional API key. Without one, a managed identity or Azure CLI token is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Model deployment name.
    pub deployment: String,
    /// `api-version` query parameter.
    pub api_version: String,
    /// Sampling temperature for structuring; kept low for factual extraction.
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Try the Container Apps managed identity when no key is configured.
    #[serde(default = "default_true")]
    pub use_managed_identity: bool,
    /// Try `az account get-access-token` when no key is configured.
    #[serde(default = "default_true")]
    pub use_azure_cli: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            deployment: "gpt-4o-mini".to_string(),
            api_version: "2024-10-21".to_string(),
            temperature: 0.1,
            max_tokens: None,
            timeout_secs: 120,
            use_managed_identity: true,
            use_azure_cli: true,
        }
    }
}

impl LlmConfig {
    /// Validate this LLM config and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        match self.endpoint.as_deref() {
            None | Some("") => warnings.push(
                "llm.endpoint is not set (AZURE_OPENAI_ENDPOINT / AI_FOUNDRY_PROJECT_ENDPOINT)"
                    .to_string(),
            ),
            Some(e) if url::Url::parse(e).is_err() => {
                warnings.push(format!("llm.endpoint '{e}' is not a valid URL"))
            }
            _ => {}
        }
        if self.temperature < 0.0 || self.temperature > 2.0 {
            warnings.push(format!(
                "llm.temperature ({}) is outside the range 0.0-2.0",
                self.temperature
            ));
        }
        if self.deployment.trim().is_empty() {
            warnings.push("llm.deployment is empty".to_string());
        }
        warnings
    }
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Request body limit for uploads.
    pub max_upload_bytes: usize,
    /// Answer CORS preflights from any origin.
    pub allow_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_upload_bytes: 20 * 1024 * 1024,
            allow_cors: false,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.max_upload_bytes < 1024 {
            warnings.push(format!(
                "server.max_upload_bytes ({}) is too small for claim images",
                self.max_upload_bytes
            ));
        }
        warnings
    }
}

/// Settings for the acceptance-test client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub api_url: String,
    pub health_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    /// Image uploaded when none is given on the command line.
    pub default_image: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            health_timeout_secs: 10,
            upload_timeout_secs: 60,
            default_image: PathBuf::from("challenge-0/data/statements/crash1_front.jpeg"),
        }
    }
}

/// Locations used by the batch statement processor and the OCR command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementsConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Where `claimflow ocr` stores `<stem>_ocr_result.json`.
    pub ocr_results_dir: PathBuf,
}

impl Default for StatementsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("challenge-0/data/statements"),
            output_dir: PathBuf::from("output/mistral"),
            ocr_results_dir: PathBuf::from("ocr_results"),
        }
    }
}

/// Container Apps deployment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Env file whose variables are passed to the container.
    pub env_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    /// Azure Container Registry name (without `.azurecr.io`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// Container Apps environment name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub app_name: String,
    pub image_name: String,
    pub image_tag: String,
    pub build_context: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<PathBuf>,
    pub target_port: u16,
    pub cpu: String,
    pub memory: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Role granted to the app's system-assigned identity.
    pub role: String,
    /// Scope of the role assignment (resource ID of the AI resource).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_scope: Option<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            env_file: PathBuf::from(".env"),
            resource_group: None,
            registry: None,
            environment: None,
            app_name: "claims-processing-api".to_string(),
            image_name: "claims-processing-api".to_string(),
            image_tag: "latest".to_string(),
            build_context: PathBuf::from("."),
            dockerfile: None,
            target_port: 8080,
            cpu: "1.0".to_string(),
            memory: "2.0Gi".to_string(),
            min_replicas: 1,
            max_replicas: 3,
            role: "Cognitive Services OpenAI User".to_string(),
            role_scope: None,
        }
    }
}

/// Retry policy for transient LLM failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Directory holding the user-level config file.
pub fn user_config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "claimflow", "claimflow")
        .map(|d| d.config_dir().to_path_buf())
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".claimflow").join("config.toml")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables prefixed with `CLAIMFLOW_` (`CLAIMFLOW_LLM__DEPLOYMENT`)
/// 3. Hackathon environment variables (see [`LEGACY_ENV_KEYS`])
/// 4. Workspace-local config (`.claimflow/config.toml`)
/// 5. User config (`~/.config/claimflow/config.toml`)
/// 6. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ClaimflowConfig>,
) -> Result<ClaimflowConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ClaimflowConfig::default()));

    if let Some(dir) = user_config_dir() {
        let user_config = dir.join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = merge_legacy_env(figment, |var| std::env::var(var).ok())?;
    figment = figment.merge(Env::prefixed("CLAIMFLOW_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Merge the hackathon environment variables found by `lookup`.
///
/// Values are taken verbatim as strings so that keys made only of digits stay keys.
/// `server.port` is the one numeric target.
fn merge_legacy_env(
    mut figment: Figment,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Figment, Box<figment::Error>> {
    for &(var, key) in LEGACY_ENV_KEYS {
        let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        if key == "server.port" {
            let port: u16 = value.trim().parse().map_err(|e| {
                Box::new(figment::Error::from(format!(
                    "{var}='{value}' is not a valid port: {e}"
                )))
            })?;
            figment = figment.merge(Serialized::default(key, port));
        } else {
            figment = figment.merge(Serialized::default(key, value));
        }
    }
    Ok(figment)
}

/// Check whether any Claimflow configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(dir) = user_config_dir()
        && dir.join("config.toml").exists()
    {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}

/// Write the default configuration to `.claimflow/config.toml`.
///
/// Returns `Ok(None)` when a file already exists and was left untouched.
pub fn init_workspace_config(workspace: &Path) -> anyhow::Result<Option<PathBuf>> {
    let path = workspace_config_path(workspace);
    if path.exists() {
        return Ok(None);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(&ClaimflowConfig::default())?;
    std::fs::write(&path, toml_str)?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClaimflowConfig::default();
        assert_eq!(config.ocr.model, "mistral-document-ai-2505");
        assert_eq!(config.ocr.timeout_secs, 300);
        assert_eq!(config.llm.deployment, "gpt-4o-mini");
        assert!((config.llm.temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.client.api_url, "http://localhost:8080");
        assert_eq!(config.deploy.role, "Cognitive Services OpenAI User");
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = ClaimflowConfig::default();
        config.deploy.resource_group = Some("rg-claims".into());
        let toml_str = toml::to_string(&config).unwrap();
        let restored: ClaimflowConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.deploy.resource_group.as_deref(), Some("rg-claims"));
        assert_eq!(restored.server.max_upload_bytes, config.server.max_upload_bytes);
    }

    #[test]
    fn test_ocr_url_trims_trailing_slash() {
        let config = OcrConfig {
            endpoint: Some("https://res.services.ai.azure.com/".into()),
            ..OcrConfig::default()
        };
        assert_eq!(
            config.ocr_url().as_deref(),
            Some("https://res.services.ai.azure.com/providers/mistral/azure/ocr")
        );
    }

    #[test]
    fn test_ocr_credentials_require_both_values() {
        let mut config = OcrConfig::default();
        assert!(config.credentials().is_none());
        config.endpoint = Some("https://x".into());
        assert!(config.credentials().is_none());
        config.api_key = Some("  ".into());
        assert!(config.credentials().is_none());
        config.api_key = Some("k".into());
        assert_eq!(config.credentials(), Some(("https://x", "k")));
    }

    #[test]
    fn test_ocr_validate_reports_missing_values() {
        let warnings = OcrConfig::default().validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("MISTRAL_DOCUMENT_AI_ENDPOINT"));
    }

    #[test]
    fn test_llm_validate_bad_temperature_and_url() {
        let config = LlmConfig {
            endpoint: Some("not a url".into()),
            temperature: 3.5,
            ..LlmConfig::default()
        };
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("not a valid URL")));
        assert!(warnings.iter().any(|w| w.contains("temperature")));
    }

    #[test]
    fn test_redacted_hides_keys() {
        let mut config = ClaimflowConfig::default();
        config.ocr.api_key = Some("secret-ocr".into());
        config.llm.api_key = Some("secret-llm".into());
        let redacted = config.redacted();
        assert_eq!(redacted.ocr.api_key.as_deref(), Some(REDACTED));
        assert_eq!(redacted.llm.api_key.as_deref(), Some(REDACTED));
        assert_eq!(config.ocr.api_key.as_deref(), Some("secret-ocr"));
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = ClaimflowConfig::default();
        overrides.llm.deployment = "gpt-4o".to_string();
        overrides.server.port = 9090;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.llm.deployment, "gpt-4o");
        assert_eq!(config.server.port, 9090);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".claimflow");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            r#"
[ocr]
endpoint = "https://ocr.example.com"
model = "mistral-document-ai-2505"
timeout_secs = 30

[deploy]
resource_group = "rg-hack"
registry = "acrhack"
environment = "cae-hack"
app_name = "claims-api"
image_name = "claims-api"
image_tag = "v2"
build_context = "."
target_port = 8080
cpu = "0.5"
memory = "1.0Gi"
min_replicas = 0
max_replicas = 2
role = "Cognitive Services OpenAI User"
env_file = ".env"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.ocr.endpoint.as_deref(), Some("https://ocr.example.com"));
        assert_eq!(config.ocr.timeout_secs, 30);
        assert_eq!(config.deploy.registry.as_deref(), Some("acrhack"));
        assert_eq!(config.deploy.image_tag, "v2");
        // Untouched sections keep their defaults.
        assert_eq!(config.llm.deployment, "gpt-4o-mini");
    }

    fn legacy(vars: &[(&str, &str)]) -> Result<ClaimflowConfig, Box<figment::Error>> {
        let vars: std::collections::HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let figment = Figment::from(Serialized::defaults(ClaimflowConfig::default()));
        merge_legacy_env(figment, |var| vars.get(var).cloned())?
            .extract()
            .map_err(Box::new)
    }

    #[test]
    fn test_legacy_env_vars_map_to_config_keys() {
        let config = legacy(&[
            ("MISTRAL_DOCUMENT_AI_ENDPOINT", "https://ocr.services.ai.azure.com"),
            ("MISTRAL_DOCUMENT_AI_KEY", "true"),
            ("MODEL_DEPLOYMENT_NAME", "gpt-4o"),
            ("AZURE_OPENAI_API_KEY", "12345"),
            ("PORT", "8000"),
            ("API_URL", "https://claims.example.io"),
        ])
        .unwrap();
        assert_eq!(
            config.ocr.endpoint.as_deref(),
            Some("https://ocr.services.ai.azure.com")
        );
        assert_eq!(config.ocr.api_key.as_deref(), Some("true"));
        assert_eq!(config.llm.deployment, "gpt-4o");
        assert_eq!(config.llm.api_key.as_deref(), Some("12345"));
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.client.api_url, "https://claims.example.io");
    }

    #[test]
    fn test_legacy_env_later_endpoint_wins_and_blanks_skipped() {
        let config = legacy(&[
            ("AZURE_OPENAI_ENDPOINT", "https://aoai.openai.azure.com"),
            ("AI_FOUNDRY_PROJECT_ENDPOINT", "https://hub.services.ai.azure.com/api/projects/p"),
            ("MODEL_DEPLOYMENT_NAME", "  "),
        ])
        .unwrap();
        assert_eq!(
            config.llm.endpoint.as_deref(),
            Some("https://hub.services.ai.azure.com/api/projects/p")
        );
        assert_eq!(config.llm.deployment, "gpt-4o-mini");
    }

    #[test]
    fn test_legacy_env_bad_port_is_an_error() {
        let err = legacy(&[("PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_init_workspace_config_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let first = init_workspace_config(dir.path()).unwrap();
        assert!(first.is_some());
        assert!(config_exists(Some(dir.path())));
        let second = init_workspace_config(dir.path()).unwrap();
        assert!(second.is_none());
    }
}
