// Vendor credential resolution
//
// A vendor credential looks like `tid=...;exp=<unix>;sku=...;proxy-ep=...;`
// and is only usable while `exp` is strictly in the future.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::providers::copilot;
use crate::config::GatewayConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("missing Copilot API key")]
    Missing,
}

#[derive(Clone, PartialEq, Eq)]
pub struct VendorCredential(String);

impl fmt::Debug for VendorCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VendorCredential")
            .field(&mask_token(&self.0))
            .finish()
    }
}

impl VendorCredential {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parsed `key=value` pairs, or `None` if any segment is malformed or `tid` is absent.
    pub fn fields(&self) -> Option<Vec<(&str, &str)>> {
        let mut fields = Vec::new();
        for part in self.0.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=')?;
            fields.push((key, value));
        }

        if fields.iter().any(|(k, _)| *k == "tid") {
            Some(fields)
        } else {
            None
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields()?
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn token_id(&self) -> Option<&str> {
        self.field("tid")
    }

    pub fn sku(&self) -> Option<&str> {
        self.field("sku")
    }

    /// Routing hint for the chat endpoint, if the credential carries one
    pub fn proxy_endpoint(&self) -> Option<&str> {
        self.field("proxy-ep").filter(|ep| !ep.is_empty())
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.field("exp")?.parse().ok()
    }

    pub fn is_valid_at(&self, now: i64) -> bool {
        matches!(self.expires_at(), Some(exp) if exp > now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(chrono::Utc::now().timestamp())
    }
}

/// Mask a secret for logs, keeping only enough to recognise it.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() < 10 {
        return "***".to_string();
    }

    if let Some(tid) = token.split(';').next().filter(|p| p.starts_with("tid=")) {
        let tid: Vec<char> = tid.chars().collect();
        if tid.len() > 12 {
            let head: String = tid[..8].iter().collect();
            let tail: String = tid[tid.len() - 4..].iter().collect();
            return format!("{}...{};***", head, tail);
        }
    }

    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Source of vendor credentials for outbound calls
#[async_trait]
pub trait CredentialSupplier: Send + Sync {
    async fn resolve(&self) -> Result<VendorCredential, CredentialError>;

    /// Forget a credential the vendor refused so the next resolve looks elsewhere.
    fn invalidate(&self, rejected: &VendorCredential);
}

/// Layered credential lookup: in-process credential, OAuth exchange, local cache file.
pub struct CredentialStore {
    current: RwLock<Option<VendorCredential>>,
    rejected: RwLock<Option<VendorCredential>>,
    oauth_token: Option<String>,
    exchange_url: String,
    local_path: Option<PathBuf>,
    http: reqwest::Client,
    exchange_lock: tokio::sync::Mutex<()>,
}

impl CredentialStore {
    pub fn new(config: &GatewayConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build token exchange HTTP client, timeouts not applied: {}", e);
                reqwest::Client::new()
            });

        Self {
            current: RwLock::new(config.copilot_api_key.clone().map(VendorCredential::new)),
            rejected: RwLock::new(None),
            oauth_token: config.oauth_token.clone(),
            exchange_url: config.token_exchange_url.clone(),
            local_path: config.resolve_local_config_path(),
            http,
            exchange_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn is_rejected(&self, credential: &VendorCredential) -> bool {
        self.rejected.read().as_ref() == Some(credential)
    }

    fn current_valid(&self) -> Option<VendorCredential> {
        self.current
            .read()
            .as_ref()
            .filter(|c| c.is_valid())
            .cloned()
    }

    async fn exchange(&self) -> Option<VendorCredential> {
        let oauth_token = self.oauth_token.as_deref()?;

        tracing::debug!(
            "Exchanging OAuth token {} for a Copilot credential",
            mask_token(oauth_token)
        );

        match copilot::exchange_oauth_token(&self.http, &self.exchange_url, oauth_token).await {
            Ok(response) => {
                let credential = VendorCredential::new(response.token);
                if !credential.is_valid() {
                    tracing::warn!("Token exchange returned an already expired credential");
                    return None;
                }
                if self.is_rejected(&credential) {
                    return None;
                }
                tracing::info!(
                    "Obtained Copilot credential {} (expires at {})",
                    mask_token(credential.as_str()),
                    response.expires_at
                );
                *self.current.write() = Some(credential.clone());
                Some(credential)
            }
            Err(e) => {
                tracing::warn!("Copilot token exchange failed: {}", e);
                None
            }
        }
    }

    fn read_local(&self) -> Option<VendorCredential> {
        let path = self.local_path.as_ref()?;
        match copilot::read_local_token(path) {
            Ok(token) => {
                let credential = VendorCredential::new(token);
                if self.is_rejected(&credential) {
                    tracing::debug!("Skipping rejected credential from {:?}", path);
                    return None;
                }
                tracing::debug!("Using Copilot credential from {:?}", path);
                Some(credential)
            }
            Err(e) => {
                tracing::debug!("No local Copilot credential: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl CredentialSupplier for CredentialStore {
    async fn resolve(&self) -> Result<VendorCredential, CredentialError> {
        if let Some(credential) = self.current_valid() {
            return Ok(credential);
        }

        {
            // One exchange at a time; whoever waited re-checks the cache first
            let _guard = self.exchange_lock.lock().await;
            if let Some(credential) = self.current_valid() {
                return Ok(credential);
            }
            if let Some(credential) = self.exchange().await {
                return Ok(credential);
            }
        }

        if let Some(credential) = self.read_local() {
            return Ok(credential);
        }

        tracing::error!("No Copilot credential available from config, exchange or local cache");
        Err(CredentialError::Missing)
    }

    fn invalidate(&self, rejected: &VendorCredential) {
        tracing::warn!(
            "Invalidating Copilot credential {}",
            mask_token(rejected.as_str())
        );
        let mut current = self.current.write();
        if current.as_ref() == Some(rejected) {
            *current = None;
        }
        *self.rejected.write() = Some(rejected.clone());
    }
}
