// GitHub Copilot credential sources
// Exchanges a GitHub OAuth token for a Copilot credential, or reads the one
// cached locally by the official editor plugins (apps.json).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotTokenResponse {
    pub token: String,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub refresh_in: Option<i64>,
}

/// Layout of the editor plugin's `apps.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalCopilotConfig {
    #[serde(default)]
    pub tokens: HashMap<String, LocalTokenInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalTokenInfo {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub provider_id: String,
}

/// Exchange a GitHub OAuth token for a short-lived Copilot credential
pub async fn exchange_oauth_token(
    client: &reqwest::Client,
    exchange_url: &str,
    oauth_token: &str,
) -> Result<CopilotTokenResponse> {
    let response = client
        .get(exchange_url)
        .header("Authorization", format!("token {}", oauth_token))
        .header("Accept", "application/json")
        .header("User-Agent", "copilot-proxy")
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!(
            "Token exchange failed with status {}: {}",
            status,
            body
        ));
    }

    let text = response.text().await?;
    let token_response: CopilotTokenResponse = serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("Failed to parse token response: {} - body: {}", e, text))?;

    if token_response.token.is_empty() {
        return Err(anyhow::anyhow!("Token exchange returned an empty token"));
    }

    Ok(token_response)
}

/// Read the first non-empty token from a local `apps.json`
pub fn read_local_token(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "GitHub Copilot config not found. Please sign in with a Copilot editor plugin first.\nExpected path: {:?}",
            path
        ));
    }

    let content = std::fs::read_to_string(path)?;
    let config: LocalCopilotConfig = serde_json::from_str(&content)?;

    // Usually a single entry; pick a stable one when there are several
    let mut entries: Vec<(&String, &LocalTokenInfo)> = config.tokens.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    entries
        .into_iter()
        .map(|(_, info)| info)
        .find(|info| !info.token.is_empty())
        .map(|info| info.token.clone())
        .ok_or_else(|| anyhow::anyhow!("No valid GitHub Copilot token found in {:?}", path))
}
