//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_common::config::AppConfig;
use herald_engine::Pipeline;
use herald_engine::ingress::IngressAdapter;
use herald_engine::interaction::InteractionProcessor;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub ingress: Arc<IngressAdapter>,
    pub interactions: Arc<InteractionProcessor>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, config: AppConfig) -> Self {
        Self {
            ingress: Arc::new(pipeline.ingress(&config)),
            interactions: Arc::new(pipeline.interactions()),
            pipeline,
            config: Arc::new(config),
        }
    }
}
