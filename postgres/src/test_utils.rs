//! Disposable warehouse databases for tests against a live Postgres server.

use config::shared::{IntoConnectOptions, PgConnectionConfig};
use pg_escape::quote_identifier;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::warn;

/// Creates the database named by `config` with one schema per entry of `namespaces`, and
/// returns a pool connected to it.
///
/// # Panics
/// Panics if the server is unreachable or any statement fails.
pub async fn create_warehouse_database(config: &PgConnectionConfig, namespaces: &[&str]) -> PgPool {
    let database = quote_identifier(&config.name);

    let mut server = PgConnection::connect_with(&config.without_db())
        .await
        .expect("Failed to connect to the test server");
    server
        .execute(&*format!("create database {database}"))
        .await
        .unwrap_or_else(|err| panic!("Failed to create database {database}: {err}"));
    let _ = server.close().await;

    let pool = PgPool::connect_with(config.with_db())
        .await
        .expect("Failed to connect to the test database");
    for namespace in namespaces {
        let statement = format!("create schema {}", quote_identifier(namespace));
        sqlx::query(&statement)
            .execute(&pool)
            .await
            .unwrap_or_else(|err| panic!("Failed to run `{statement}`: {err}"));
    }

    pool
}

/// Closes `pool`, disconnects the remaining sessions of the database and drops it.
///
/// Failures are logged and swallowed so that cleanup of one test never fails another.
pub async fn drop_warehouse_database(config: &PgConnectionConfig, pool: &PgPool) {
    pool.close().await;

    let mut server = match PgConnection::connect_with(&config.without_db()).await {
        Ok(server) => server,
        Err(err) => {
            warn!(database = %config.name, error = %err, "could not connect to drop test database");
            return;
        }
    };

    // Sessions detached from the pool, e.g. abandoned rollbacks, would block the drop.
    if let Err(err) = sqlx::query(
        "select pg_terminate_backend(pid) from pg_stat_activity where datname = $1 and pid <> pg_backend_pid()",
    )
    .bind(&config.name)
    .execute(&mut server)
    .await
    {
        warn!(database = %config.name, error = %err, "could not terminate test database sessions");
    }

    let statement = format!("drop database if exists {}", quote_identifier(&config.name));
    if let Err(err) = server.execute(&*statement).await {
        warn!(database = %config.name, error = %err, "could not drop test database");
    }
}
