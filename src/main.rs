use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use netd_service::{run_daemon, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("netd_service=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting NetD Service...");

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded: {:?}", config);

    run_daemon(config).await
}
