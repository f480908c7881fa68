use config::shared::{LoaderConfig, PgConnectionConfig, TlsConfig, WarehouseConfig};
use postgres::test_utils::{create_warehouse_database, drop_warehouse_database};
use secrecy::Secret;
use sqlx::PgPool;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::PROVIDER;
use crate::core::PostgresWarehouse;
use crate::source::LoadFileSource;
use crate::staging::staging_table_prefix;

/// Namespace every test warehouse writes into.
pub const TEST_NAMESPACE: &str = "warehouse_test";

pub const TEST_WORKSPACE_ID: &str = "test-workspace";

pub const TEST_DESTINATION_ID: &str = "test-destination";

/// Connection parameters of a fresh, uniquely named database on the local test server.
///
/// Configuration is read from environment variables:
/// - `TESTS_DATABASE_HOST`: Postgres server hostname (required)
/// - `TESTS_DATABASE_PORT`: Postgres server port (required)
/// - `TESTS_DATABASE_USERNAME`: Database user (required)
/// - `TESTS_DATABASE_PASSWORD`: Database password (optional)
pub fn local_pg_connection_config() -> PgConnectionConfig {
    PgConnectionConfig {
        host: std::env::var("TESTS_DATABASE_HOST").expect("TESTS_DATABASE_HOST must be set"),
        port: std::env::var("TESTS_DATABASE_PORT")
            .expect("TESTS_DATABASE_PORT must be set")
            .parse()
            .expect("TESTS_DATABASE_PORT must be a valid port number"),
        name: Uuid::new_v4().to_string(),
        username: std::env::var("TESTS_DATABASE_USERNAME")
            .expect("TESTS_DATABASE_USERNAME must be set"),
        password: std::env::var("TESTS_DATABASE_PASSWORD")
            .ok()
            .map(Secret::new),
        tls: TlsConfig {
            trusted_root_certs: String::new(),
            enabled: false,
        },
    }
}

/// Isolated warehouse database, dropped together with this value.
///
/// Dropping requires a multi-threaded tokio runtime.
pub struct TestWarehouseDatabase {
    pub config: PgConnectionConfig,
    pub pool: PgPool,
}

impl TestWarehouseDatabase {
    /// Creates the database and the [`TEST_NAMESPACE`] schema.
    pub async fn new() -> Self {
        let config = local_pg_connection_config();
        let pool = create_warehouse_database(&config, &[TEST_NAMESPACE]).await;

        Self { config, pool }
    }

    pub fn warehouse_config(&self) -> WarehouseConfig {
        WarehouseConfig {
            workspace_id: TEST_WORKSPACE_ID.to_string(),
            destination_id: TEST_DESTINATION_ID.to_string(),
            namespace: TEST_NAMESPACE.to_string(),
            connection: self.config.clone(),
        }
    }

    /// Builds a warehouse sharing this database's pool.
    pub fn warehouse<S>(&self, loader: LoaderConfig, source: S) -> PostgresWarehouse<S>
    where
        S: LoadFileSource,
    {
        PostgresWarehouse::new(self.pool.clone(), &self.warehouse_config(), loader, source)
    }

    /// Runs `statement` in the test database.
    pub async fn execute(&self, statement: &str) {
        sqlx::query(statement)
            .execute(&self.pool)
            .await
            .unwrap_or_else(|err| panic!("Failed to execute `{statement}`: {err}"));
    }

    /// Names of all tables in the test namespace, sorted.
    pub async fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = sqlx::query_scalar(
            "select table_name::text from information_schema.tables where table_schema = $1",
        )
        .bind(TEST_NAMESPACE)
        .fetch_all(&self.pool)
        .await
        .expect("Failed to list tables");
        tables.sort();

        tables
    }

    /// Names of the staging tables currently present in the test namespace.
    pub async fn staging_tables(&self) -> Vec<String> {
        let prefix = staging_table_prefix(PROVIDER);

        self.tables()
            .await
            .into_iter()
            .filter(|table| table.starts_with(&prefix))
            .collect()
    }
}

impl Drop for TestWarehouseDatabase {
    fn drop(&mut self) {
        // `block_in_place` needs a multi-threaded runtime to offload the other tasks.
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tokio::task::block_in_place(|| {
                Handle::current().block_on(async {
                    drop_warehouse_database(&self.config, &self.pool).await;
                });
            });
        }));
    }
}
