// GitHub Copilot chat API client

use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::auth::credential::{mask_token, CredentialError, CredentialSupplier, VendorCredential};
use crate::config::GatewayConfig;
use crate::proxy::router::{resolve_model, ModelCatalog};
use crate::proxy::ModelDescriptor;

const INTEGRATION_ID: &str = "vscode-chat";
const OPENAI_INTENT: &str = "conversation-agent";
const GITHUB_API_VERSION: &str = "2025-04-01";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to reach Copilot API: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Copilot API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode Copilot response: {0}")]
    Decode(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("{0}")]
    InvalidPayload(serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<RemoteModel>,
}

#[derive(Debug, Deserialize)]
struct RemoteModel {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Clone)]
pub struct CopilotClient {
    config: Arc<GatewayConfig>,
    credentials: Arc<dyn CredentialSupplier>,
    catalog: Arc<ModelCatalog>,
    http_client: reqwest::Client,
}

impl CopilotClient {
    pub fn new(
        config: Arc<GatewayConfig>,
        credentials: Arc<dyn CredentialSupplier>,
        catalog: Arc<ModelCatalog>,
    ) -> Self {
        // Streaming calls must not be cut by a fixed deadline; non-streaming
        // calls set their own per-request timeout.
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build Copilot API HTTP client, timeouts not applied: {}", e);
                reqwest::Client::new()
            });

        Self {
            config,
            credentials,
            catalog,
            http_client,
        }
    }

    /// Full URL for a vendor path, routed via the credential's `proxy-ep` hint.
    pub fn endpoint_url(&self, credential: &VendorCredential, path: &str) -> String {
        let host = credential
            .proxy_endpoint()
            .unwrap_or(&self.config.upstream_host)
            .trim_end_matches('/');

        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}{}", host, path)
        } else {
            format!("https://{}{}", host, path)
        }
    }

    fn identity_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let plugin_version = self.config.editor_plugin_version();
        let user_agent = format!(
            "GitHubCopilotChat/{}",
            plugin_version.trim_start_matches("copilot-chat/")
        );

        request
            .header("Editor-Version", self.config.editor_version())
            .header("Editor-Plugin-Version", plugin_version)
            .header("Copilot-Integration-ID", INTEGRATION_ID)
            .header("User-Agent", user_agent)
            .header("OpenAI-Intent", OPENAI_INTENT)
            .header("X-GitHub-API-Version", GITHUB_API_VERSION)
    }

    /// Send a request built for the resolved credential, retrying once with a
    /// fresh credential if the vendor answers 401.
    async fn send_with_credential<F>(&self, build: F) -> Result<reqwest::Response, UpstreamError>
    where
        F: Fn(&VendorCredential) -> reqwest::RequestBuilder,
    {
        let credential = self.credentials.resolve().await?;
        let response = build(&credential).send().await?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::warn!(
            "Copilot rejected credential {}, re-resolving once",
            mask_token(credential.as_str())
        );
        self.credentials.invalidate(&credential);

        let retry_credential = self.credentials.resolve().await?;
        Ok(build(&retry_credential).send().await?)
    }

    async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(UpstreamError::Status { status, body })
    }

    /// Vendor model list, served from the catalog cache while it is fresh.
    pub async fn fetch_models(&self) -> Result<Vec<ModelDescriptor>, UpstreamError> {
        if let Some(models) = self.catalog.fresh() {
            return Ok(models);
        }

        let response = self
            .send_with_credential(|credential| {
                self.identity_headers(
                    self.http_client
                        .get(self.endpoint_url(credential, "/models"))
                        .bearer_auth(credential.as_str())
                        .timeout(Duration::from_secs(self.config.request_timeout_secs)),
                )
            })
            .await?;
        let response = Self::error_for_status(response).await?;

        let text = response.text().await?;
        let parsed: ModelsResponse =
            serde_json::from_str(&text).map_err(|e| UpstreamError::Decode(e.to_string()))?;

        let models: Vec<ModelDescriptor> = parsed
            .data
            .iter()
            .map(|m| ModelDescriptor::from_catalog(&m.id, &m.name, self.config.default_limits))
            .collect();

        tracing::info!("Fetched {} models from Copilot", models.len());
        self.catalog.store(models.clone());
        Ok(models)
    }

    /// Map a caller-supplied model name onto a model the vendor actually lists.
    ///
    /// Static catalog entries are reference data for policy checks only; an id
    /// the vendor does not serve is never forwarded.
    pub async fn resolve_model(&self, requested: &str) -> Result<ModelDescriptor, UpstreamError> {
        let fetched = self.fetch_models().await?;
        resolve_model(&fetched, requested)
            .cloned()
            .ok_or_else(|| UpstreamError::UnknownModel(requested.to_string()))
    }

    /// Vendor payload with the model forced and unset generation parameters defaulted.
    pub fn build_payload(&self, provider_request: &str, model_id: &str) -> Result<Value, UpstreamError> {
        let mut payload: Map<String, Value> = match serde_json::from_str(provider_request)
            .map_err(UpstreamError::InvalidPayload)?
        {
            Value::Object(map) => map,
            other => {
                return Err(UpstreamError::Decode(format!(
                    "provider request must be a JSON object, got {}",
                    other
                )))
            }
        };

        // Gateway-side routing marker, not part of the vendor schema
        payload.remove("provider");

        let defaults = &self.config.generation_defaults;
        payload.insert("model".to_string(), Value::String(model_id.to_string()));
        payload.insert("stream".to_string(), Value::Bool(true));
        payload
            .entry("temperature")
            .or_insert_with(|| serde_json::json!(defaults.temperature));
        payload
            .entry("top_p")
            .or_insert_with(|| serde_json::json!(defaults.top_p));
        payload
            .entry("max_tokens")
            .or_insert_with(|| serde_json::json!(defaults.max_tokens));

        Ok(Value::Object(payload))
    }

    /// Call the chat completion endpoint; the vendor always streams.
    ///
    /// `client_streaming` only decides whether the fixed request timeout applies.
    pub async fn complete(
        &self,
        model_id: &str,
        provider_request: &str,
        client_streaming: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        let payload = self.build_payload(provider_request, model_id)?;
        let request_id = Uuid::new_v4().to_string();

        tracing::debug!(
            "Copilot completion request {} for model {} (client streaming: {})",
            request_id,
            model_id,
            client_streaming
        );

        let response = self
            .send_with_credential(|credential| {
                let mut request = self
                    .identity_headers(
                        self.http_client
                            .post(self.endpoint_url(credential, "/chat/completions"))
                            .bearer_auth(credential.as_str()),
                    )
                    .header("Content-Type", "application/json")
                    .header("X-Initiator", "user")
                    .header("X-Interaction-Type", OPENAI_INTENT)
                    .header("X-Request-ID", &request_id)
                    .json(&payload);

                if let Some(machine_id) = &self.config.vscode_machine_id {
                    request = request.header("Vscode-Machineid", machine_id);
                }
                if let Some(session_id) = &self.config.vscode_session_id {
                    request = request.header("Vscode-Sessionid", session_id);
                }
                if !client_streaming {
                    request = request.timeout(Duration::from_secs(self.config.request_timeout_secs));
                }
                request
            })
            .await?;

        Self::error_for_status(response).await
    }
}
