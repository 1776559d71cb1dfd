//! Herald API server binary entrypoint.

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::{AppConfig, StorageBackend};
use herald_engine::Pipeline;
use herald_notifier::DeliveryRuntime;
use herald_notifier::webhook::WebhookClient;

use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=debug,herald_engine=info,herald_notifier=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Herald API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect ledger, queue and rate-limit backends
    let pipeline = Pipeline::connect(&config).await?;
    tracing::info!(storage = ?config.storage, "Delivery pipeline ready");

    // Workers in-process, or leave delivery to herald-notifier
    let runtime = if config.worker.embedded {
        let client = Arc::new(WebhookClient::new(
            &config.webhooks,
            config.worker.send_timeout(),
        )?);
        Some(DeliveryRuntime::start(&pipeline, client, &config)?)
    } else {
        if config.storage == StorageBackend::Memory {
            tracing::warn!("Memory storage without embedded workers: nothing will be delivered");
        }
        None
    };

    let addr = config.bind_addr.clone();
    let state = AppState::new(pipeline, config);

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    if let Some(runtime) = runtime {
        runtime.shutdown().await;
    }

    Ok(())
}
