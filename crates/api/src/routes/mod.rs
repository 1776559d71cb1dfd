pub mod health;
pub mod insights;
pub mod interactions;
pub mod notifications;
pub mod queue;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(insights::router())
        .merge(interactions::router())
        .merge(notifications::router())
        .merge(queue::router())
        .with_state(state)
}
