//! Crash recovery: removal of staging tables left behind by interrupted loads.

use postgres::schema::{TableName, escape_like_pattern};
use sqlx::Row;
use tracing::{error, info};

use crate::PROVIDER;
use crate::core::PostgresWarehouse;
use crate::error::WarehouseResult;
use crate::metrics::{
    DESTINATION_ID_LABEL, NAMESPACE_LABEL, WH_PG_DANGLING_STAGING_TABLES_DROPPED_TOTAL,
    WORKSPACE_ID_LABEL,
};
use crate::source::LoadFileSource;
use crate::staging::staging_table_prefix;

impl<S> PostgresWarehouse<S>
where
    S: LoadFileSource,
{
    /// Drops every staging table of the namespace. Run once on startup.
    pub async fn crash_recover(&self) {
        self.drop_dangling_staging_tables().await;
    }

    /// Sweeps leftover staging tables and closes the pool.
    pub async fn cleanup(&self) {
        self.drop_dangling_staging_tables().await;
        self.pool.close().await;
    }

    /// Drops every table of the namespace carrying the staging prefix of this provider,
    /// regardless of which load created it.
    ///
    /// Returns `true` only if the listing and every drop succeeded. Individual failures are
    /// logged and do not stop the sweep.
    pub async fn drop_dangling_staging_tables(&self) -> bool {
        let prefix = staging_table_prefix(PROVIDER);

        let staging_tables = match self.list_staging_tables(&prefix).await {
            Ok(tables) => tables,
            Err(err) => {
                error!(
                    namespace = %self.namespace,
                    error = %err,
                    "failed to list dangling staging tables"
                );
                return false;
            }
        };

        info!(
            namespace = %self.namespace,
            count = staging_tables.len(),
            tables = ?staging_tables,
            "dropping dangling staging tables"
        );

        let mut all_dropped = true;
        for staging_table in &staging_tables {
            let statement = format!(
                "DROP TABLE {}",
                TableName::new(&self.namespace, staging_table).as_quoted_identifier()
            );

            match self.executor().execute(&statement).await {
                Ok(_) => {
                    metrics::counter!(
                        WH_PG_DANGLING_STAGING_TABLES_DROPPED_TOTAL,
                        WORKSPACE_ID_LABEL => self.workspace_id.clone(),
                        DESTINATION_ID_LABEL => self.destination_id.clone(),
                        NAMESPACE_LABEL => self.namespace.clone(),
                    )
                    .increment(1);
                }
                Err(err) => {
                    error!(
                        staging_table = %staging_table,
                        error = %err,
                        "failed to drop dangling staging table"
                    );
                    all_dropped = false;
                }
            }
        }

        all_dropped
    }

    async fn list_staging_tables(&self, prefix: &str) -> WarehouseResult<Vec<String>> {
        let rows = self
            .executor()
            .fetch_all(
                sqlx::query(
                    "SELECT table_name::text FROM information_schema.tables WHERE table_schema = $1 AND table_name LIKE $2",
                )
                .bind(&self.namespace)
                .bind(format!("{}%", escape_like_pattern(prefix))),
            )
            .await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let table: String = row.try_get(0)?;
            if table.starts_with(prefix) {
                tables.push(table);
            }
        }

        Ok(tables)
    }
}
