// Gateway errors and the OpenAI error envelope

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use super::copilot::UpstreamError;
use crate::auth::credential::CredentialError;
use crate::auth::TokenError;
use crate::proxy::policy::{PolicyError, RateLimitDimension};
use crate::proxy::translator::NormalizeError;

pub const TOKEN_EXPIRED_HEADER: &str = "X-LLM-Token-Expired";

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized")]
    TokenInvalid,

    #[error("token expired")]
    TokenExpired,

    #[error("{0}")]
    AccessDenied(PolicyError),

    #[error("rate limit exceeded: maximum {dimension} reached")]
    RateLimited {
        dimension: RateLimitDimension,
        retry_after_secs: u64,
    },

    #[error("{0}")]
    MalformedRequest(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("missing Copilot API key")]
    CredentialMissing,

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::TokenInvalid | GatewayError::TokenExpired => StatusCode::UNAUTHORIZED,
            GatewayError::AccessDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::MalformedRequest(_) | GatewayError::UnknownModel(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::CredentialMissing | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::TokenInvalid
            | GatewayError::TokenExpired
            | GatewayError::MalformedRequest(_)
            | GatewayError::UnknownModel(_) => "invalid_request_error",
            GatewayError::AccessDenied(_) => "permission_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::Upstream(_) => "api_error",
            GatewayError::CredentialMissing | GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Replace the default `Retry-After` hint on rate-limit errors.
    pub fn with_retry_after(self, secs: u64) -> Self {
        match self {
            GatewayError::RateLimited { dimension, .. } => GatewayError::RateLimited {
                dimension,
                retry_after_secs: secs,
            },
            other => other,
        }
    }
}

impl From<TokenError> for GatewayError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => GatewayError::TokenExpired,
            TokenError::Invalid => GatewayError::TokenInvalid,
            TokenError::Signing(msg) => GatewayError::Internal(msg),
        }
    }
}

impl From<PolicyError> for GatewayError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::RateLimited(dimension) => GatewayError::RateLimited {
                dimension,
                retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
            },
            PolicyError::UnknownModel(model) => GatewayError::UnknownModel(model),
            other => GatewayError::AccessDenied(other),
        }
    }
}

impl From<NormalizeError> for GatewayError {
    fn from(err: NormalizeError) -> Self {
        GatewayError::MalformedRequest(err.to_string())
    }
}

impl From<CredentialError> for GatewayError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Missing => GatewayError::CredentialMissing,
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Credential(e) => e.into(),
            UpstreamError::UnknownModel(model) => GatewayError::UnknownModel(model),
            UpstreamError::InvalidPayload(e) => {
                GatewayError::MalformedRequest(format!("invalid provider request: {}", e))
            }
            other => GatewayError::Upstream(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed ({}): {}", status, self);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self);
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "param": null,
                "code": null
            }
        }));

        let mut response = (status, body).into_response();
        match &self {
            GatewayError::TokenExpired => {
                response
                    .headers_mut()
                    .insert(TOKEN_EXPIRED_HEADER, HeaderValue::from_static("true"));
            }
            GatewayError::RateLimited { retry_after_secs, .. } => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
            }
            _ => {}
        }
        response
    }
}
