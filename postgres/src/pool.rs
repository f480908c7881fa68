use std::time::Duration;

use config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

/// Connects to the destination warehouse database.
///
/// When `acquire_timeout` is set it bounds both the initial connection and every later
/// checkout from the pool.
pub async fn connect_to_warehouse(
    config: &PgConnectionConfig,
    min_connections: u32,
    max_connections: u32,
    acquire_timeout: Option<Duration>,
) -> Result<PgPool, sqlx::Error> {
    debug!(
        host = %config.host,
        port = config.port,
        database = %config.name,
        "connecting to warehouse"
    );

    let options = config.with_db();

    let mut pool_options = PgPoolOptions::new()
        .min_connections(min_connections)
        .max_connections(max_connections);
    if let Some(timeout) = acquire_timeout {
        pool_options = pool_options.acquire_timeout(timeout);
    }

    let pool = pool_options.connect_with(options).await?;

    Ok(pool)
}
