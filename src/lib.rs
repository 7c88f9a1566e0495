// Copilot Gateway - OpenAI-compatible front end for the GitHub Copilot chat API

pub mod api;
pub mod auth;
pub mod commands;
pub mod config;
pub mod proxy;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = commands::Cli::parse();
    commands::execute(cli).await
}
