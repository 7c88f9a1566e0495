// Request normalizer - gateway envelope or raw OpenAI chat body into one internal shape

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::CompletionRequest;
use crate::auth::LlmToken;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid request body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid request body: expected a JSON object")]
    NotAnObject,

    #[error("invalid provider_request: expected a JSON object")]
    InvalidProviderRequest,
}

/// The gateway's own `{model, provider_request}` envelope
#[derive(Debug, Deserialize)]
struct CompletionParams {
    #[serde(default)]
    model: String,
    #[serde(default)]
    provider_request: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBody {
    pub model: String,
    pub provider_request: String,
    /// Whether the caller asked for an SSE response
    pub stream: bool,
}

impl NormalizedBody {
    pub fn into_request(
        self,
        token: LlmToken,
        country_code: Option<String>,
        current_spending_cents: u32,
    ) -> CompletionRequest {
        CompletionRequest {
            model: self.model,
            provider_request: self.provider_request,
            token,
            country_code,
            current_spending_cents,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestNormalizer {
    default_model: String,
    default_provider: String,
}

impl RequestNormalizer {
    pub fn new(default_model: impl Into<String>, default_provider: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            default_provider: default_provider.into(),
        }
    }

    pub fn normalize(&self, body: &[u8]) -> Result<NormalizedBody, NormalizeError> {
        let mut incoming: Map<String, Value> = match serde_json::from_slice(body)? {
            Value::Object(map) => map,
            _ => return Err(NormalizeError::NotAnObject),
        };

        // The vendor is always called in streaming mode; the flag only picks
        // how the response is packaged for the caller.
        let stream = incoming
            .remove("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let stripped = Value::Object(incoming);

        if let Ok(params) = CompletionParams::deserialize(&stripped) {
            if !params.provider_request.is_empty() {
                match serde_json::from_str::<Value>(&params.provider_request) {
                    Ok(Value::Object(_)) => {}
                    _ => return Err(NormalizeError::InvalidProviderRequest),
                }
                let model = if params.model.is_empty() {
                    self.default_model.clone()
                } else {
                    params.model
                };
                return Ok(NormalizedBody {
                    model,
                    provider_request: params.provider_request,
                    stream,
                });
            }
        }

        let Value::Object(mut openai_request) = stripped else {
            return Err(NormalizeError::NotAnObject);
        };

        let model = openai_request
            .get("model")
            .and_then(|v| v.as_str())
            .filter(|m| !m.is_empty())
            .map(|m| m.to_string())
            .unwrap_or_else(|| self.default_model.clone());

        if !openai_request.contains_key("provider") {
            openai_request.insert(
                "provider".to_string(),
                Value::String(self.default_provider.clone()),
            );
        }

        Ok(NormalizedBody {
            model,
            provider_request: Value::Object(openai_request).to_string(),
            stream,
        })
    }
}
