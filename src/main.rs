//! CLI entry point launching the inpaintforge pipeline.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = inpaintforge::config::CliArgs::parse();
    let config = inpaintforge::config::AppConfig::load(cli).await?;

    if let Err(error) = inpaintforge::run(config).await {
        tracing::error!(error = %error, "inpainting failed");
        return Err(error.into());
    }

    Ok(())
}
