// Command-line entry points

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::api::copilot::CopilotClient;
use crate::api::streaming::{self, ChatAggregator, StreamState, UsageRecorder};
use crate::auth::credential::{mask_token, CredentialStore, CredentialSupplier, VendorCredential};
use crate::auth::providers::copilot;
use crate::auth::TokenService;
use crate::config::GatewayConfig;
use crate::proxy::router::ModelCatalog;
use crate::proxy::usage::UsageTracker;

/// OpenAI-compatible gateway for the GitHub Copilot chat API
#[derive(Debug, Parser)]
#[command(name = "copilot-gateway", version)]
#[command(about = "OpenAI-compatible gateway for the GitHub Copilot chat API", long_about = None)]
pub struct Cli {
    /// YAML configuration file; environment variables override its values
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP gateway (default)
    Serve,
    /// Print a signed internal bearer token
    IssueToken {
        #[arg(long, default_value_t = 1)]
        user_id: u64,
        #[arg(long, default_value = "local-user")]
        name: String,
    },
    /// Exchange a GitHub OAuth token for a Copilot credential
    GetApiKey {
        /// Falls back to COPILOT_OAUTH_TOKEN / OAUTH_TOKEN
        #[arg(long)]
        oauth_token: Option<String>,
    },
    /// Show the fields and validity of a Copilot credential
    CheckCredential {
        /// Falls back to the resolved credential
        token: Option<String>,
    },
    /// Send a single prompt through the Copilot API
    Prompt {
        text: String,
        #[arg(short, long)]
        model: Option<String>,
        /// Print deltas as they arrive
        #[arg(long)]
        stream: bool,
    },
}

pub async fn execute(cli: Cli) -> Result<()> {
    let config = Arc::new(GatewayConfig::load(cli.config.as_deref())?);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::IssueToken { user_id, name } => issue_token(&config, user_id, &name),
        Commands::GetApiKey { oauth_token } => get_api_key(&config, oauth_token).await,
        Commands::CheckCredential { token } => check_credential(&config, token).await,
        Commands::Prompt {
            text,
            model,
            stream,
        } => prompt(config, &text, model, stream).await,
    }
}

async fn serve(config: Arc<GatewayConfig>) -> Result<()> {
    crate::api::start_server(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    })
    .await
}

fn issue_token(config: &GatewayConfig, user_id: u64, name: &str) -> Result<()> {
    if config.llm_api_secret.is_empty() {
        anyhow::bail!("LLM_API_SECRET must be set to sign tokens");
    }
    let service = TokenService::new(&config.llm_api_secret, false);
    let token = service.issue(user_id, name)?;
    println!("{}", token);
    Ok(())
}

async fn get_api_key(config: &GatewayConfig, oauth_token: Option<String>) -> Result<()> {
    let oauth_token = oauth_token
        .or_else(|| config.oauth_token.clone())
        .context("No OAuth token given; pass --oauth-token or set COPILOT_OAUTH_TOKEN")?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()?;
    let response = copilot::exchange_oauth_token(&client, &config.token_exchange_url, &oauth_token).await?;

    tracing::info!("Exchanged OAuth token {}", mask_token(&oauth_token));
    println!("{}", response.token);
    Ok(())
}

/// Human-readable report on a credential's embedded fields
pub fn describe_credential(credential: &VendorCredential, now: i64) -> String {
    let mut lines = vec![format!("credential: {}", mask_token(credential.as_str()))];

    match credential.fields() {
        Some(fields) => {
            for (key, value) in fields {
                if key == "tid" {
                    lines.push(format!("  {} = {}", key, mask_token(value)));
                } else {
                    lines.push(format!("  {} = {}", key, value));
                }
            }
        }
        None => lines.push("  (not a key=value credential)".to_string()),
    }

    match credential.expires_at() {
        Some(exp) if exp > now => lines.push(format!("valid: yes (expires in {}s)", exp - now)),
        Some(exp) => lines.push(format!("valid: no (expired {}s ago)", now - exp)),
        None => lines.push("valid: no (missing or malformed exp)".to_string()),
    }

    lines.join("\n")
}

async fn check_credential(config: &GatewayConfig, token: Option<String>) -> Result<()> {
    let credential = match token {
        Some(token) => VendorCredential::new(token),
        None => CredentialStore::new(config).resolve().await?,
    };
    println!("{}", describe_credential(&credential, chrono::Utc::now().timestamp()));
    Ok(())
}

async fn prompt(config: Arc<GatewayConfig>, text: &str, model: Option<String>, stream: bool) -> Result<()> {
    let credentials: Arc<dyn CredentialSupplier> = Arc::new(CredentialStore::new(&config));
    let catalog = Arc::new(ModelCatalog::new(Duration::from_secs(config.models_cache_ttl_secs)));
    let client = CopilotClient::new(config.clone(), credentials, catalog);

    let requested = model.unwrap_or_else(|| config.default_model.clone());
    let resolved = client.resolve_model(&requested).await?;
    let payload = json!({"messages": [{"role": "user", "content": text}]}).to_string();

    let response = client.complete(&resolved.id, &payload, stream).await?;
    let tracker = Arc::new(UsageTracker::new());
    let recorder = UsageRecorder::new(tracker.clone(), 0, &resolved.id, payload.len());

    if !stream {
        let completion = streaming::aggregate(response.bytes_stream(), &resolved.id, recorder).await?;
        println!(
            "{}",
            completion["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default()
        );
    } else {
        let relayed = streaming::passthrough(response.bytes_stream(), recorder);
        print_deltas(relayed, &mut std::io::stdout()).await?;
    }

    let usage = tracker.snapshot(0, &resolved.id);
    tracing::info!(
        "Prompt used ~{} tokens on {}",
        usage.tokens_this_minute,
        resolved.id
    );
    Ok(())
}

/// Write each content delta of a relayed SSE stream as it arrives; returns the full text.
async fn print_deltas<S, W>(lines: S, out: &mut W) -> Result<String>
where
    S: Stream<Item = std::result::Result<Bytes, std::io::Error>>,
    W: Write,
{
    let mut lines = std::pin::pin!(lines);
    let mut aggregator = ChatAggregator::new();

    while let Some(line) = lines.next().await {
        let line = line?;
        if let Some(chunk) = aggregator.feed_line(&String::from_utf8_lossy(&line)) {
            if let Some(delta) = chunk.pointer("/choices/0/delta/content").and_then(|v| v.as_str()) {
                write!(out, "{}", delta)?;
                out.flush()?;
            }
        }
        if aggregator.state() == StreamState::Done {
            break;
        }
    }

    writeln!(out)?;
    Ok(aggregator.content().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["copilot-gateway"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "copilot-gateway",
            "--config",
            "gateway.yaml",
            "issue-token",
            "--user-id",
            "7",
            "--name",
            "octocat",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("gateway.yaml")));
        match cli.command {
            Some(Commands::IssueToken { user_id, name }) => {
                assert_eq!(user_id, 7);
                assert_eq!(name, "octocat");
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::try_parse_from(["copilot-gateway", "prompt", "hello", "--stream"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Prompt { ref text, stream: true, model: None }) if text == "hello"
        ));
    }

    #[test]
    fn test_describe_credential() {
        let credential = VendorCredential::new("tid=0123456789abcdef;exp=1100;sku=free_limited;");
        let report = describe_credential(&credential, 1000);
        assert!(report.contains("sku = free_limited"));
        assert!(report.contains("valid: yes (expires in 100s)"));
        assert!(!report.contains("0123456789abcdef"));

        let expired = describe_credential(&credential, 1200);
        assert!(expired.contains("valid: no (expired 100s ago)"));

        let opaque = describe_credential(&VendorCredential::new("ghu_plainoauthtoken"), 0);
        assert!(opaque.contains("not a key=value credential"));
        assert!(opaque.contains("missing or malformed exp"));
    }

    #[tokio::test]
    async fn test_print_deltas_records_streamed_usage() {
        let tracker = Arc::new(UsageTracker::new());
        let recorder = UsageRecorder::new(tracker.clone(), 0, "gpt-4o", 8);
        let parts: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(format!("data: {}\n\n", json!({"choices": [{"delta": {"content": "Hel"}}]})))),
            Ok(Bytes::from(format!("data: {}\n\n", json!({"choices": [{"delta": {"content": "lo"}}]})))),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ];
        let relayed = streaming::passthrough(futures::stream::iter(parts), recorder);

        let mut out = Vec::new();
        let text = print_deltas(relayed, &mut out).await.unwrap();

        assert_eq!(text, "Hello");
        assert_eq!(String::from_utf8(out).unwrap(), "Hello\n");
        let usage = tracker.snapshot(0, "gpt-4o");
        assert_eq!(usage.requests_this_minute, 1);
        assert_eq!(usage.input_tokens_this_minute, 2);
        assert_eq!(usage.output_tokens_this_minute, 2);
    }

    #[test]
    fn test_issue_token_requires_secret() {
        assert!(issue_token(&GatewayConfig::default(), 1, "a").is_err());
    }
}
