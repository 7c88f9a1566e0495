// Proxy module - request normalization, model catalog, usage and access policy

pub mod policy;
pub mod router;
pub mod translator;
pub mod usage;

use serde::{Deserialize, Serialize};

use crate::auth::LlmToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Copilot,
    #[serde(untagged)]
    Other(String),
}

impl Provider {
    pub fn from_tag(tag: &str) -> Self {
        if tag.is_empty() || tag.eq_ignore_ascii_case("copilot") {
            Provider::Copilot
        } else {
            Provider::Other(tag.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Provider::Copilot => "copilot",
            Provider::Other(tag) => tag,
        }
    }
}

/// Per-model ceilings enforced by the access policy.
///
/// A ceiling is exceeded only when the counter read before the request is
/// strictly greater than it, so a per-minute ceiling of `n` admits `n + 1`
/// requests in one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelLimits {
    #[serde(default = "default_requests_per_minute")]
    pub max_requests_per_minute: u64,
    #[serde(default = "default_tokens_per_minute")]
    pub max_tokens_per_minute: u64,
    #[serde(default = "default_input_tokens_per_minute")]
    pub max_input_tokens_per_minute: u64,
    #[serde(default = "default_output_tokens_per_minute")]
    pub max_output_tokens_per_minute: u64,
    #[serde(default = "default_tokens_per_day")]
    pub max_tokens_per_day: u64,
}

fn default_requests_per_minute() -> u64 {
    25
}

fn default_tokens_per_minute() -> u64 {
    5000
}

fn default_input_tokens_per_minute() -> u64 {
    2500
}

fn default_output_tokens_per_minute() -> u64 {
    2500
}

fn default_tokens_per_day() -> u64 {
    100_000
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_requests_per_minute(),
            max_tokens_per_minute: default_tokens_per_minute(),
            max_input_tokens_per_minute: default_input_tokens_per_minute(),
            max_output_tokens_per_minute: default_output_tokens_per_minute(),
            max_tokens_per_day: default_tokens_per_day(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub provider: Provider,
    pub enabled: bool,
    #[serde(flatten)]
    pub limits: ModelLimits,
}

impl ModelDescriptor {
    /// Entry decoded from the vendor's model list; always enabled.
    pub fn from_catalog(id: &str, name: &str, limits: ModelLimits) -> Self {
        let name = if name.is_empty() { id } else { name };
        Self {
            id: id.to_string(),
            name: name.to_string(),
            provider: Provider::Copilot,
            enabled: true,
            limits,
        }
    }

    pub fn matches_name(&self, model: &str) -> bool {
        self.id == model || self.name == model
    }
}

/// Static model table used before (or without) a live catalog
pub fn default_models() -> Vec<ModelDescriptor> {
    vec![ModelDescriptor {
        id: "copilot-chat".to_string(),
        name: "copilot-chat".to_string(),
        provider: Provider::Copilot,
        enabled: true,
        limits: ModelLimits::default(),
    }]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Rough token count for text we could not get a vendor count for
pub fn estimate_tokens(byte_len: usize) -> u64 {
    (byte_len as u64).div_ceil(4)
}

/// Normalized completion envelope handed to the vendor client
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    /// Vendor-shaped JSON payload, already stripped of `stream`
    pub provider_request: String,
    pub token: LlmToken,
    pub country_code: Option<String>,
    pub current_spending_cents: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_tags() {
        assert_eq!(Provider::from_tag("copilot"), Provider::Copilot);
        assert_eq!(Provider::from_tag(""), Provider::Copilot);
        assert_eq!(
            Provider::from_tag("openai"),
            Provider::Other("openai".to_string())
        );
        assert_eq!(Provider::Other("openai".to_string()).as_str(), "openai");
    }

    #[test]
    fn test_catalog_entry_falls_back_to_id_for_name() {
        let model = ModelDescriptor::from_catalog("gpt-4o", "", ModelLimits::default());
        assert_eq!(model.name, "gpt-4o");
        assert!(model.enabled);
        assert!(model.matches_name("gpt-4o"));
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(8), 2);
        assert_eq!(estimate_tokens(9), 3);
    }
}
