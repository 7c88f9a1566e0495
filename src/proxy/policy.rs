// Access policy - geography, model access and rate-limit checks

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::router::ModelCatalog;
use super::usage::UsageRecord;
use super::Provider;
use crate::auth::LlmToken;

/// Countries where access is blocked under export regulations
const RESTRICTED_COUNTRIES: &[&str] = &[
    "AF", // Afghanistan
    "BY", // Belarus
    "CF", // Central African Republic
    "CN", // China
    "CU", // Cuba
    "ER", // Eritrea
    "ET", // Ethiopia
    "IR", // Iran
    "KP", // North Korea
    "XK", // Kosovo
    "LY", // Libya
    "MM", // Myanmar
    "RU", // Russia
    "SO", // Somalia
    "SS", // South Sudan
    "SD", // Sudan
    "SY", // Syria
    "VE", // Venezuela
    "YE", // Yemen
];

/// Marker code some edge proxies use for Tor exit nodes
const TOR_NETWORK: &str = "T1";

/// Placeholder code meaning "country unknown"
const UNKNOWN_COUNTRY: &str = "XX";

/// Checked in declaration order; the first exceeded ceiling is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDimension {
    RequestsPerMinute,
    TokensPerMinute,
    InputTokensPerMinute,
    OutputTokensPerMinute,
    TokensPerDay,
}

impl fmt::Display for RateLimitDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RateLimitDimension::RequestsPerMinute => "requests_per_minute",
            RateLimitDimension::TokensPerMinute => "tokens_per_minute",
            RateLimitDimension::InputTokensPerMinute => "input_tokens_per_minute",
            RateLimitDimension::OutputTokensPerMinute => "output_tokens_per_minute",
            RateLimitDimension::TokensPerDay => "tokens_per_day",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("no country code provided")]
    NoCountryCode,

    #[error("access via TOR network is not allowed: access to {0} models is not available over TOR")]
    TorNetwork(String),

    #[error("access from this region is restricted: access to {provider} models is not available in your region ({country})")]
    RestrictedRegion { provider: String, country: String },

    #[error("this model is not available in your plan: {0}")]
    ModelNotAvailable(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("rate limit exceeded: maximum {0} reached")]
    RateLimited(RateLimitDimension),
}

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    catalog: Arc<ModelCatalog>,
}

impl AccessPolicy {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self { catalog }
    }

    pub fn check_country(&self, country_code: Option<&str>, provider: &Provider) -> Result<(), PolicyError> {
        let code = match country_code {
            None => return Err(PolicyError::NoCountryCode),
            Some(code) if code.is_empty() || code == UNKNOWN_COUNTRY => {
                return Err(PolicyError::NoCountryCode)
            }
            Some(code) => code,
        };

        if code == TOR_NETWORK {
            return Err(PolicyError::TorNetwork(provider.as_str().to_string()));
        }

        if RESTRICTED_COUNTRIES.contains(&code) {
            return Err(PolicyError::RestrictedRegion {
                provider: provider.as_str().to_string(),
                country: code.to_string(),
            });
        }

        Ok(())
    }

    /// Personal-use plans may call every enabled model.
    pub fn check_model_access(&self, _token: &LlmToken, _provider: &Provider, model: &str) -> Result<(), PolicyError> {
        match self.catalog.lookup(model) {
            Some(descriptor) if !descriptor.enabled => {
                Err(PolicyError::ModelNotAvailable(model.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn check_rate_limit(&self, model: &str, usage: &UsageRecord) -> Result<(), PolicyError> {
        let descriptor = self
            .catalog
            .lookup(model)
            .ok_or_else(|| PolicyError::UnknownModel(model.to_string()))?;
        let limits = descriptor.limits;

        let checks = [
            (
                usage.requests_this_minute,
                limits.max_requests_per_minute,
                RateLimitDimension::RequestsPerMinute,
            ),
            (
                usage.tokens_this_minute,
                limits.max_tokens_per_minute,
                RateLimitDimension::TokensPerMinute,
            ),
            (
                usage.input_tokens_this_minute,
                limits.max_input_tokens_per_minute,
                RateLimitDimension::InputTokensPerMinute,
            ),
            (
                usage.output_tokens_this_minute,
                limits.max_output_tokens_per_minute,
                RateLimitDimension::OutputTokensPerMinute,
            ),
            (
                usage.tokens_this_day,
                limits.max_tokens_per_day,
                RateLimitDimension::TokensPerDay,
            ),
        ];

        for (used, ceiling, dimension) in checks {
            if used > ceiling {
                tracing::warn!(
                    "Rate limit hit for user {} on {}: {} ({} > {})",
                    usage.user_id,
                    model,
                    dimension,
                    used,
                    ceiling
                );
                return Err(PolicyError::RateLimited(dimension));
            }
        }

        Ok(())
    }
}
