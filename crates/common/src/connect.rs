//! Backend connections for the durable storage profile.

use std::time::Duration;

use redis::aio::ConnectionManager;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::AppConfig;

const PG_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the ledger pool and bring the schema up to date.
pub async fn postgres(config: &AppConfig) -> anyhow::Result<PgPool> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the postgres backend"))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(PG_ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;
    tracing::info!(max_connections = config.db_max_connections, "Connected to PostgreSQL");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Ledger migrations applied");
    Ok(pool)
}

/// Redis connection shared by the work queue and the rate-limit buckets.
///
/// `ConnectionManager` reconnects on its own and clones share one socket.
pub async fn redis(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;
    let _: String = redis::cmd("PING").query_async(&mut manager).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
