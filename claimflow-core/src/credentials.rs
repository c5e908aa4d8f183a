//! Credentials for the Azure OpenAI deployment.
//!
//! Provides a trait-based abstraction over token acquisition with these implementations:
//! - `StaticCredential`: a configured API key or pre-issued bearer token.
//! - `ManagedIdentityCredential`: the Container Apps / App Service identity endpoint.
//! - `AzureCliCredential`: `az account get-access-token` on a developer machine.
//! - `ChainedCredential`: tries a list of sources in order.

use crate::config::LlmConfig;
use crate::error::LlmError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Token audience for Azure AI services.
pub const COGNITIVE_SERVICES_RESOURCE: &str = "https://cognitiveservices.azure.com";

const IDENTITY_API_VERSION: &str = "2019-08-01";

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 300;

/// An authentication value attached to outgoing requests.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Sent as the `api-key` header.
    ApiKey(String),
    /// Sent as `Authorization: Bearer <token>`.
    Bearer(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::ApiKey(_) => write!(f, "ApiKey(********)"),
            Credential::Bearer(_) => write!(f, "Bearer(********)"),
        }
    }
}

impl Credential {
    /// Attach this credential to a request.
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credential::ApiKey(key) => request.header("api-key", key),
            Credential::Bearer(token) => request.bearer_auth(token),
        }
    }
}

/// A source of credentials.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Produce a credential, fetching or refreshing a token if needed.
    async fn credential(&self) -> Result<Credential, LlmError>;

    /// Short name used in logs and error messages.
    fn name(&self) -> &str;
}

/// A fixed credential.
pub struct StaticCredential {
    credential: Credential,
}

impl StaticCredential {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            credential: Credential::ApiKey(key.into()),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            credential: Credential::Bearer(token.into()),
        }
    }
}

#[async_trait]
impl TokenSource for StaticCredential {
    async fn credential(&self) -> Result<Credential, LlmError> {
        Ok(self.credential.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(REFRESH_MARGIN_SECS) < self.expires_at
    }
}

/// Parse an `expires_on` value: epoch seconds as a number or a numeric string.
pub fn parse_expires_on(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp(secs, 0)
}

fn fallback_expiry() -> DateTime<Utc> {
    Utc::now() + Duration::minutes(55)
}

/// Token from the managed identity endpoint exposed inside Container Apps.
pub struct ManagedIdentityCredential {
    client: reqwest::Client,
    endpoint: String,
    header: String,
    resource: String,
    cache: Mutex<Option<CachedToken>>,
}

impl ManagedIdentityCredential {
    pub fn new(
        endpoint: impl Into<String>,
        header: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            header: header.into(),
            resource: resource.into(),
            cache: Mutex::new(None),
        }
    }

    /// Build from `IDENTITY_ENDPOINT` / `IDENTITY_HEADER`, if the process runs with an identity.
    pub fn from_env(resource: &str) -> Option<Self> {
        let endpoint = std::env::var("IDENTITY_ENDPOINT").ok()?;
        let header = std::env::var("IDENTITY_HEADER").ok()?;
        Some(Self::new(endpoint, header, resource))
    }

    async fn fetch(&self) -> Result<CachedToken, LlmError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("resource", self.resource.as_str()),
                ("api-version", IDENTITY_API_VERSION),
            ])
            .header("X-IDENTITY-HEADER", &self.header)
            .send()
            .await
            .map_err(|e| LlmError::Credential {
                message: format!("managed identity endpoint unreachable: {e}"),
            })?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| LlmError::Credential {
            message: format!("managed identity returned invalid JSON: {e}"),
        })?;
        if !status.is_success() {
            return Err(LlmError::Credential {
                message: format!("managed identity returned {status}: {body}"),
            });
        }

        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| LlmError::Credential {
                message: "managed identity response has no access_token".to_string(),
            })?
            .to_string();
        let expires_at = parse_expires_on(&body["expires_on"]).unwrap_or_else(fallback_expiry);
        Ok(CachedToken { token, expires_at })
    }
}

#[async_trait]
impl TokenSource for ManagedIdentityCredential {
    async fn credential(&self) -> Result<Credential, LlmError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.is_fresh(Utc::now())
        {
            return Ok(Credential::Bearer(cached.token.clone()));
        }
        let fresh = self.fetch().await?;
        debug!(expires_at = %fresh.expires_at, "Acquired managed identity token");
        let credential = Credential::Bearer(fresh.token.clone());
        *cache = Some(fresh);
        Ok(credential)
    }

    fn name(&self) -> &str {
        "managed-identity"
    }
}

/// Token from the signed-in Azure CLI account.
pub struct AzureCliCredential {
    resource: String,
    program: String,
    cache: Mutex<Option<CachedToken>>,
}

impl AzureCliCredential {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            program: "az".to_string(),
            cache: Mutex::new(None),
        }
    }

    /// Parse the JSON printed by `az account get-access-token`.
    fn parse_output(stdout: &str) -> Result<CachedToken, LlmError> {
        let body: Value = serde_json::from_str(stdout).map_err(|e| LlmError::Credential {
            message: format!("az account get-access-token printed invalid JSON: {e}"),
        })?;
        let token = body["accessToken"]
            .as_str()
            .ok_or_else(|| LlmError::Credential {
                message: "az account get-access-token output has no accessToken".to_string(),
            })?
            .to_string();
        let expires_at = parse_expires_on(&body["expires_on"]).unwrap_or_else(fallback_expiry);
        Ok(CachedToken { token, expires_at })
    }

    async fn fetch(&self) -> Result<CachedToken, LlmError> {
        let output = Command::new(&self.program)
            .args([
                "account",
                "get-access-token",
                "--resource",
                &self.resource,
                "--output",
                "json",
            ])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LlmError::Credential {
                message: format!("failed to run az: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LlmError::Credential {
                message: format!("az account get-access-token failed: {}", stderr.trim()),
            });
        }
        Self::parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl TokenSource for AzureCliCredential {
    async fn credential(&self) -> Result<Credential, LlmError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.is_fresh(Utc::now())
        {
            return Ok(Credential::Bearer(cached.token.clone()));
        }
        let fresh = self.fetch().await?;
        let credential = Credential::Bearer(fresh.token.clone());
        *cache = Some(fresh);
        Ok(credential)
    }

    fn name(&self) -> &str {
        "azure-cli"
    }
}

/// Tries each source in order and returns the first credential obtained.
pub struct ChainedCredential {
    sources: Vec<Arc<dyn TokenSource>>,
}

impl ChainedCredential {
    pub fn new(sources: Vec<Arc<dyn TokenSource>>) -> Self {
        Self { sources }
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl TokenSource for ChainedCredential {
    async fn credential(&self) -> Result<Credential, LlmError> {
        let mut failures = Vec::new();
        for source in &self.sources {
            match source.credential().await {
                Ok(credential) => return Ok(credential),
                Err(e) => {
                    warn!(source = source.name(), error = %e, "Credential source failed");
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }
        Err(LlmError::Credential {
            message: if failures.is_empty() {
                "no credential sources configured".to_string()
            } else {
                failures.join("; ")
            },
        })
    }

    fn name(&self) -> &str {
        "chain"
    }
}

/// Build the credential chain for an LLM config: API key, then managed identity, then Azure CLI.
pub fn credential_chain(config: &LlmConfig) -> ChainedCredential {
    let mut sources: Vec<Arc<dyn TokenSource>> = Vec::new();
    if let Some(key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        sources.push(Arc::new(StaticCredential::api_key(key)));
    }
    if config.use_managed_identity
        && let Some(mi) = ManagedIdentityCredential::from_env(COGNITIVE_SERVICES_RESOURCE)
    {
        sources.push(Arc::new(mi));
    }
    if config.use_azure_cli {
        sources.push(Arc::new(AzureCliCredential::new(COGNITIVE_SERVICES_RESOURCE)));
    }
    ChainedCredential::new(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::Query, http::HeaderMap, routing::get};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingSource;

    #[async_trait]
    impl TokenSource for FailingSource {
        async fn credential(&self) -> Result<Credential, LlmError> {
            Err(LlmError::Credential {
                message: "nope".into(),
            })
        }
        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_debug_hides_secret() {
        let text = format!("{:?}", Credential::ApiKey("super-secret".into()));
        assert!(!text.contains("super-secret"));
    }

    #[test]
    fn test_parse_expires_on_variants() {
        let expected = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(parse_expires_on(&json!(1_700_000_000)), Some(expected));
        assert_eq!(parse_expires_on(&json!("1700000000")), Some(expected));
        assert_eq!(parse_expires_on(&json!("2024-01-01 10:00:00")), None);
        assert_eq!(parse_expires_on(&Value::Null), None);
    }

    #[test]
    fn test_cached_token_freshness() {
        let now = Utc::now();
        let soon = CachedToken {
            token: "t".into(),
            expires_at: now + Duration::seconds(60),
        };
        assert!(!soon.is_fresh(now));
        let later = CachedToken {
            token: "t".into(),
            expires_at: now + Duration::hours(1),
        };
        assert!(later.is_fresh(now));
    }

    #[test]
    fn test_parse_az_cli_output() {
        let out = r#"{"accessToken":"eyJ0","expiresOn":"2030-01-01 00:00:00.000000","expires_on":1893456000,"tokenType":"Bearer"}"#;
        let token = AzureCliCredential::parse_output(out).unwrap();
        assert_eq!(token.token, "eyJ0");
        assert_eq!(token.expires_at.timestamp(), 1_893_456_000);

        assert!(AzureCliCredential::parse_output("{}").is_err());
    }

    #[tokio::test]
    async fn test_chain_falls_through_to_working_source() {
        let chain = ChainedCredential::new(vec![
            Arc::new(FailingSource) as Arc<dyn TokenSource>,
            Arc::new(StaticCredential::bearer("tok")),
        ]);
        assert_eq!(
            chain.credential().await.unwrap(),
            Credential::Bearer("tok".into())
        );
    }

    #[tokio::test]
    async fn test_chain_reports_all_failures() {
        let chain = ChainedCredential::new(vec![Arc::new(FailingSource) as Arc<dyn TokenSource>]);
        let err = chain.credential().await.unwrap_err();
        assert!(err.to_string().contains("failing: Credential unavailable: nope"));

        let empty = ChainedCredential::new(Vec::new());
        assert!(
            empty
                .credential()
                .await
                .unwrap_err()
                .to_string()
                .contains("no credential sources")
        );
    }

    #[test]
    fn test_credential_chain_prefers_api_key() {
        let config = LlmConfig {
            api_key: Some("k".into()),
            use_managed_identity: false,
            use_azure_cli: false,
            ..LlmConfig::default()
        };
        let chain = credential_chain(&config);
        assert_eq!(chain.source_names(), vec!["static"]);
    }

    #[tokio::test]
    async fn test_managed_identity_fetches_and_caches() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/msi/token",
            get(
                move |headers: HeaderMap, Query(q): Query<HashMap<String, String>>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(headers["x-identity-header"], "secret-header");
                        assert_eq!(q["resource"], COGNITIVE_SERVICES_RESOURCE);
                        assert_eq!(q["api-version"], IDENTITY_API_VERSION);
                        let expires = (Utc::now() + Duration::hours(1)).timestamp().to_string();
                        Json(json!({"access_token": "mi-token", "expires_on": expires}))
                    }
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let mi = ManagedIdentityCredential::new(
            format!("http://{addr}/msi/token"),
            "secret-header",
            COGNITIVE_SERVICES_RESOURCE,
        );
        assert_eq!(
            mi.credential().await.unwrap(),
            Credential::Bearer("mi-token".into())
        );
        assert_eq!(
            mi.credential().await.unwrap(),
            Credential::Bearer("mi-token".into())
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
