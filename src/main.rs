mod config;
mod llm;
mod platform;
mod webhook;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::llm::GeminiClient;
use crate::platform::telegram::TelegramClient;
use crate::webhook::WebhookAdapter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gemini_telegram_bot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Config path is optional; environment variables fill in the secrets
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Model: {}", config.llm.model);
    info!("  Telegram API: {}", config.telegram.api_url);
    info!("  Bind address: {}", config.server.bind_address);

    let telegram = Arc::new(TelegramClient::new(config.telegram.clone()));
    if let Some(url) = &config.telegram.webhook_url {
        telegram
            .set_webhook(url)
            .await
            .with_context(|| format!("Failed to register webhook {}", url))?;
    }

    let gemini = Arc::new(GeminiClient::new(config.llm.clone()));
    let adapter = Arc::new(WebhookAdapter::new(gemini, telegram));

    info!("Webhook is starting...");
    webhook::serve(&config.server, adapter).await?;

    Ok(())
}
