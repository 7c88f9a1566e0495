// Configuration module for the Copilot gateway

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::proxy::ModelLimits;

pub const DEFAULT_EDITOR_VERSION: &str = "vscode/1.99.2";
pub const DEFAULT_EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.26.3";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Secret used to sign and verify internal bearer tokens
    #[serde(default)]
    pub llm_api_secret: String,

    #[serde(default)]
    pub disable_auth: bool,

    /// Vendor credential supplied out-of-band
    #[serde(default)]
    pub copilot_api_key: Option<String>,

    /// Upstream OAuth token exchanged for a vendor credential
    #[serde(default)]
    pub oauth_token: Option<String>,

    #[serde(default)]
    pub editor_version: Option<String>,

    #[serde(default)]
    pub editor_plugin_version: Option<String>,

    #[serde(default)]
    pub vscode_machine_id: Option<String>,

    #[serde(default)]
    pub vscode_session_id: Option<String>,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_provider")]
    pub default_provider: String,

    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    #[serde(default = "default_token_exchange_url")]
    pub token_exchange_url: String,

    /// Overrides the per-OS location of the local `apps.json` cache
    #[serde(default)]
    pub local_config_path: Option<PathBuf>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_models_cache_ttl_secs")]
    pub models_cache_ttl_secs: u64,

    #[serde(default)]
    pub enforce_country: bool,

    #[serde(default = "default_country_header")]
    pub country_header: String,

    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,

    #[serde(default)]
    pub default_limits: ModelLimits,

    #[serde(default)]
    pub generation_defaults: GenerationDefaults,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_provider() -> String {
    "copilot".to_string()
}

fn default_upstream_host() -> String {
    "api.githubcopilot.com".to_string()
}

fn default_token_exchange_url() -> String {
    "https://api.github.com/copilot_internal/v2/token".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_models_cache_ttl_secs() -> u64 {
    300
}

fn default_country_header() -> String {
    "CF-IPCountry".to_string()
}

fn default_retry_after_secs() -> u64 {
    60
}

/// Generation parameters filled in when the caller leaves them out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GenerationDefaults {
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_top_p() -> f64 {
    1.0
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            llm_api_secret: String::new(),
            disable_auth: false,
            copilot_api_key: None,
            oauth_token: None,
            editor_version: None,
            editor_plugin_version: None,
            vscode_machine_id: None,
            vscode_session_id: None,
            default_model: default_model(),
            default_provider: default_provider(),
            upstream_host: default_upstream_host(),
            token_exchange_url: default_token_exchange_url(),
            local_config_path: None,
            request_timeout_secs: default_request_timeout_secs(),
            models_cache_ttl_secs: default_models_cache_ttl_secs(),
            enforce_country: false,
            country_header: default_country_header(),
            retry_after_secs: default_retry_after_secs(),
            default_limits: ModelLimits::default(),
            generation_defaults: GenerationDefaults::default(),
        }
    }
}

impl GatewayConfig {
    /// Load the YAML file (if any) and apply process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let config: GatewayConfig = serde_yaml::from_str(&content)?;
                tracing::info!("Config loaded from {:?}", path);
                config
            }
            None => GatewayConfig::default(),
        };

        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Override fields from an environment-style lookup.
    ///
    /// Empty values are treated as unset.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("HOST") {
            self.host = host;
        }
        if let Some(port) = get("PORT") {
            match port.trim().parse() {
                Ok(port) => self.port = port,
                Err(_) => tracing::warn!("Ignoring invalid PORT value: {}", port),
            }
        }
        if let Some(secret) = get("LLM_API_SECRET") {
            self.llm_api_secret = secret;
        }
        if let Some(flag) = get("DISABLE_AUTH") {
            self.disable_auth = flag == "true" || flag == "1";
        }
        if let Some(key) = get("COPILOT_API_KEY") {
            self.copilot_api_key = Some(key);
        }
        if let Some(token) = get("COPILOT_OAUTH_TOKEN").or_else(|| get("OAUTH_TOKEN")) {
            // .env files sometimes keep the quotes
            self.oauth_token = Some(token.trim_matches(|c| c == '\'' || c == '"').to_string());
        }
        if let Some(v) = get("EDITOR_VERSION") {
            self.editor_version = Some(v);
        }
        if let Some(v) = get("EDITOR_PLUGIN_VERSION") {
            self.editor_plugin_version = Some(v);
        }
        if let Some(v) = get("VSCODE_MACHINE_ID") {
            self.vscode_machine_id = Some(v);
        }
        if let Some(v) = get("VSCODE_SESSION_ID") {
            self.vscode_session_id = Some(v);
        }
    }

    pub fn editor_version(&self) -> &str {
        self.editor_version
            .as_deref()
            .unwrap_or(DEFAULT_EDITOR_VERSION)
    }

    pub fn editor_plugin_version(&self) -> &str {
        self.editor_plugin_version
            .as_deref()
            .unwrap_or(DEFAULT_EDITOR_PLUGIN_VERSION)
    }

    pub fn listen_addr(&self) -> String {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        };
        format!("{}:{}", host, self.port)
    }

    /// Location of the vendor's locally cached `apps.json`
    pub fn resolve_local_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.local_config_path {
            return Some(path.clone());
        }

        if cfg!(target_os = "windows") {
            // %APPDATA%\GitHub Copilot\apps.json
            dirs::config_dir().map(|dir| dir.join("GitHub Copilot").join("apps.json"))
        } else {
            dirs::home_dir().map(|home| home.join(".config/github-copilot/apps.json"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.default_model, "gpt-4o");
        assert_eq!(config.editor_version(), DEFAULT_EDITOR_VERSION);
        assert_eq!(config.editor_plugin_version(), DEFAULT_EDITOR_PLUGIN_VERSION);
        assert_eq!(config.retry_after_secs, 60);
        assert!(!config.disable_auth);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        config.apply_env(lookup_from(&[
            ("PORT", "9000"),
            ("LLM_API_SECRET", "s3cret"),
            ("DISABLE_AUTH", "1"),
            ("OAUTH_TOKEN", "\"ghu_abc\""),
            ("EDITOR_VERSION", "vscode/2.0.0"),
        ]));

        assert_eq!(config.port, 9000);
        assert_eq!(config.llm_api_secret, "s3cret");
        assert!(config.disable_auth);
        assert_eq!(config.oauth_token.as_deref(), Some("ghu_abc"));
        assert_eq!(config.editor_version(), "vscode/2.0.0");
    }

    #[test]
    fn test_copilot_oauth_token_wins_over_generic() {
        let mut config = GatewayConfig::default();
        config.apply_env(lookup_from(&[
            ("COPILOT_OAUTH_TOKEN", "ghu_specific"),
            ("OAUTH_TOKEN", "ghu_generic"),
        ]));
        assert_eq!(config.oauth_token.as_deref(), Some("ghu_specific"));
    }

    #[test]
    fn test_yaml_uses_kebab_case() {
        let yaml = r#"
port: 9999
default-model: gpt-4o-mini
enforce-country: true
default-limits:
  max-requests-per-minute: 3
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.default_model, "gpt-4o-mini");
        assert!(config.enforce_country);
        assert_eq!(config.default_limits.max_requests_per_minute, 3);
        assert_eq!(config.default_limits.max_tokens_per_day, 100_000);
    }

    #[test]
    fn test_local_config_path_override() {
        let config = GatewayConfig {
            local_config_path: Some(PathBuf::from("/tmp/apps.json")),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_local_config_path(),
            Some(PathBuf::from("/tmp/apps.json"))
        );
    }
}
