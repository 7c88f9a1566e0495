// API request handlers

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    Extension,
};
use serde::Serialize;
use serde_json::{json, Value};

use super::error::GatewayError;
use super::streaming::{self, UsageRecorder};
use super::AppState;
use crate::auth::LlmToken;
use crate::config::GatewayConfig;
use crate::proxy::Provider;

// Root endpoint
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Copilot Gateway",
        "endpoints": [
            "GET /models",
            "GET /v1/models",
            "POST /completion",
            "POST /openai",
            "POST /v1/chat/completions"
        ]
    }))
}

// OpenAI compatible endpoints
#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

fn country_code(headers: &HeaderMap, config: &GatewayConfig) -> Option<String> {
    headers
        .get(config.country_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_uppercase())
        .filter(|v| !v.is_empty())
}

pub async fn list_models(
    State(state): State<AppState>,
    Extension(token): Extension<LlmToken>,
    headers: HeaderMap,
) -> Result<Json<ModelsResponse>, GatewayError> {
    let models = state.copilot.fetch_models().await?;
    let country = country_code(&headers, &state.config);

    let data = models
        .into_iter()
        .filter(|model| {
            if state.config.enforce_country
                && state
                    .policy
                    .check_country(country.as_deref(), &model.provider)
                    .is_err()
            {
                return false;
            }
            state
                .policy
                .check_model_access(&token, &model.provider, &model.id)
                .is_ok()
        })
        .map(|model| ModelInfo {
            owned_by: model.provider.as_str().to_string(),
            id: model.id,
            object: "model".to_string(),
            created: 0,
            name: model.name,
        })
        .collect();

    Ok(Json(ModelsResponse {
        object: "list".to_string(),
        data,
    }))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(token): Extension<LlmToken>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let normalized = state.normalizer.normalize(&body)?;
    let stream = normalized.stream;
    let country = country_code(&headers, &state.config);
    let request = normalized.into_request(token, country, 0);
    let provider = Provider::from_tag(&state.config.default_provider);

    if state.config.enforce_country {
        state
            .policy
            .check_country(request.country_code.as_deref(), &provider)?;
    }

    let model = state.copilot.resolve_model(&request.model).await?;
    state
        .policy
        .check_model_access(&request.token, &provider, &model.id)?;

    let usage = state.usage.snapshot(request.token.user_id, &model.id);
    state
        .policy
        .check_rate_limit(&model.id, &usage)
        .map_err(|e| GatewayError::from(e).with_retry_after(state.config.retry_after_secs))?;

    tracing::info!(
        "Completion for user {} via {} (requested {}, stream: {})",
        request.token.user_id,
        model.id,
        request.model,
        stream
    );

    let response = state
        .copilot
        .complete(&model.id, &request.provider_request, stream)
        .await?;

    let recorder = UsageRecorder::new(
        state.usage.clone(),
        request.token.user_id,
        &model.id,
        request.provider_request.len(),
    );

    if stream {
        let relayed = streaming::passthrough(response.bytes_stream(), recorder);
        return Ok(streaming::sse_response(relayed));
    }

    let completion = streaming::aggregate(response.bytes_stream(), &request.model, recorder).await?;
    Ok(Json(completion).into_response())
}
