use financial_dispatch_core::{api::start_server, config::AppConfig, dispatch::build_dispatcher};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;

    info!("Financial dispatch core - API server");
    info!(
        port = config.port,
        model = %config.gemini_model,
        threshold = config.dispatch.confidence_threshold,
        persistent = config.database_url.is_some(),
        "Configuration loaded"
    );

    let dispatcher = Arc::new(build_dispatcher(&config)?);
    info!(workers = dispatcher.registry().len(), "Dispatcher initialized");

    start_server(dispatcher, config.port).await?;

    Ok(())
}
