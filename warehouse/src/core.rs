use std::time::Duration;

use config::shared::{LoaderConfig, WarehouseConfig};
use postgres::pool::connect_to_warehouse;
use sqlx::PgPool;

use crate::error::WarehouseResult;
use crate::executor::Executor;
use crate::merge::DedupKeys;
use crate::metrics::register_metrics;
use crate::source::LoadFileSource;
use crate::tags::LoadTags;

/// Connections kept open by [`PostgresWarehouse::connect`].
const MIN_POOL_CONNECTIONS: u32 = 1;
/// Upper bound of concurrent connections opened by [`PostgresWarehouse::connect`].
const MAX_POOL_CONNECTIONS: u32 = 8;

/// Postgres destination of one warehouse namespace.
///
/// Tables of one namespace may be loaded concurrently through a shared reference; each load
/// uses its own transaction and a uniquely named staging table.
#[derive(Debug)]
pub struct PostgresWarehouse<S> {
    pub(crate) pool: PgPool,
    pub(crate) namespace: String,
    pub(crate) workspace_id: String,
    pub(crate) destination_id: String,
    pub(crate) loader: LoaderConfig,
    pub(crate) dedup_keys: DedupKeys,
    pub(crate) source: S,
}

impl<S> PostgresWarehouse<S>
where
    S: LoadFileSource,
{
    pub fn new(pool: PgPool, warehouse: &WarehouseConfig, loader: LoaderConfig, source: S) -> Self {
        register_metrics();

        Self {
            pool,
            namespace: warehouse.namespace.clone(),
            workspace_id: warehouse.workspace_id.clone(),
            destination_id: warehouse.destination_id.clone(),
            dedup_keys: DedupKeys::with_overrides(&loader.dedup_keys),
            loader,
            source,
        }
    }

    /// Opens a connection pool to the warehouse and wraps it.
    pub async fn connect(
        warehouse: &WarehouseConfig,
        loader: LoaderConfig,
        source: S,
    ) -> WarehouseResult<Self> {
        let pool = connect_to_warehouse(
            &warehouse.connection,
            MIN_POOL_CONNECTIONS,
            MAX_POOL_CONNECTIONS,
            loader.connect_timeout(),
        )
        .await?;

        Ok(Self::new(pool, warehouse, loader, source))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn loader_config(&self) -> &LoaderConfig {
        &self.loader
    }

    pub fn dedup_keys(&self) -> &DedupKeys {
        &self.dedup_keys
    }

    pub(crate) fn executor(&self) -> Executor<'_> {
        Executor::non_transactional(&self.pool, self.slow_query_threshold())
    }

    pub(crate) fn slow_query_threshold(&self) -> Duration {
        self.loader.slow_query_threshold()
    }

    pub(crate) fn explain_enabled(&self) -> bool {
        self.loader.execution_plan_enabled(&self.workspace_id)
    }

    pub(crate) fn load_tags(&self, table: &str) -> LoadTags {
        LoadTags {
            workspace_id: self.workspace_id.clone(),
            namespace: self.namespace.clone(),
            destination_id: self.destination_id.clone(),
            table: table.to_string(),
            stage: None,
        }
    }
}
