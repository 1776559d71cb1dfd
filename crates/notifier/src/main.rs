use std::sync::Arc;

use herald_common::config::{AppConfig, StorageBackend};
use herald_engine::Pipeline;
use herald_notifier::DeliveryRuntime;
use herald_notifier::webhook::WebhookClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald notifier starting...");

    let config = AppConfig::from_env()?;
    if config.storage == StorageBackend::Memory {
        anyhow::bail!(
            "the standalone notifier needs shared storage; use HERALD_STORAGE=postgres or run workers embedded in herald-api"
        );
    }

    let pipeline = Pipeline::connect(&config).await?;
    let client = Arc::new(WebhookClient::new(
        &config.webhooks,
        config.worker.send_timeout(),
    )?);

    let runtime = DeliveryRuntime::start(&pipeline, client, &config)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    runtime.shutdown().await;

    tracing::info!("Herald notifier stopped.");
    Ok(())
}
