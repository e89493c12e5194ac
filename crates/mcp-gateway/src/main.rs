use std::sync::Arc;

use anyhow::Context;
use mcp_gateway::{BridgeConfig, GATEWAY_VERSION, GatewayService, ServerConfig, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    tracing::info!(version = GATEWAY_VERSION, "Starting mcp-gateway");

    // The child reads its token from the inherited environment; log only
    // whether one is set, never the value.
    let token_present = std::env::var_os("GITHUB_PERSONAL_ACCESS_TOKEN").is_some();
    tracing::info!(token_present, "GitHub token check");

    let service = Arc::new(GatewayService::new(BridgeConfig::from_env()));
    service
        .start()
        .await
        .context("failed to start the MCP server process")?;

    serve(ServerConfig::from_env(), service).await
}
