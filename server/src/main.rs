//! Instagram DM storefront assistant.
//!
//! Receives Instagram messaging webhooks, answers customers with a
//! function-calling language model grounded in each shop's catalog, and
//! keeps an audit log of every inbound and outgoing message.

mod app;
mod catalog;
mod config;
mod conversation;
mod error;
mod gateway;
mod llm;
mod post_context;
mod prompting;
mod responder;
mod store;
mod tools;
mod types;
mod webhook;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,storefront_chat=debug")),
        )
        .init();

    info!("Starting storefront chat server v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env();
    info!(
        addr = %config.http_addr,
        graph_api_base = %config.graph_api_base,
        model = %config.ai.model,
        signature_check = config.app_secret.is_some(),
        admin_enabled = config.admin_token.is_some(),
        "Loaded configuration"
    );

    app::run(config).await
}
