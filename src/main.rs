use anyhow::{Context, Result};
use confab::config::ServerConfig;
use confab::server::serve;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,confab=debug")),
        )
        .init();

    let config = ServerConfig::load();
    tracing::info!(
        "Starting confab session orchestrator (config: {:?}, model: {})",
        ServerConfig::config_path(),
        config.llm_model
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve(config))
}
