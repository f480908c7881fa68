//! Schema and table management in the warehouse namespace.

use chrono::{DateTime, Utc};
use postgres::schema::{TableName, escape_like_pattern};
use postgres::types::{DataType, Schema, TableSchema, UnrecognizedSchema, columns_with_data_types};
use pg_escape::quote_identifier;
use sqlx::{Connection, Row};
use tracing::{debug, error, info, warn};

use crate::core::PostgresWarehouse;
use crate::error::{ErrorKind, WarehouseResult};
use crate::metrics::{
    DATATYPE_LABEL, DESTINATION_ID_LABEL, WH_MISSING_DATATYPE_TOTAL, WORKSPACE_ID_LABEL,
};
use crate::source::LoadFileSource;
use crate::staging::staging_table_prefix;
use crate::{PROVIDER, RECENCY_COLUMN, bail};

/// Parameters of the retention delete issued by [`PostgresWarehouse::delete_by`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteByParams {
    /// Rows written by this job run are kept.
    pub job_run_id: String,
    /// Rows written by this task run are kept.
    pub task_run_id: String,
    pub source_id: String,
    /// Only rows received before this instant are deleted.
    pub start_time: DateTime<Utc>,
}

/// Retention delete of one table; binds job run id, task run id, source id and start time.
pub fn delete_by_statement(namespace: &str, table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE context_sources_job_run_id <> $1 AND context_sources_task_run_id <> $2 AND context_source_id = $3 AND {} < $4",
        TableName::new(namespace, table).as_quoted_identifier(),
        quote_identifier(RECENCY_COLUMN),
    )
}

/// Adds every column of `columns` to `table` in one statement.
pub fn add_columns_statement(namespace: &str, table: &str, columns: &TableSchema) -> String {
    let additions = columns
        .iter()
        .map(|(name, data_type)| {
            format!(
                "ADD COLUMN IF NOT EXISTS {} {}",
                quote_identifier(name),
                data_type.to_postgres()
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "ALTER TABLE {} {additions}",
        TableName::new(namespace, table).as_quoted_identifier()
    )
}

impl<S> PostgresWarehouse<S>
where
    S: LoadFileSource,
{
    /// Creates the namespace schema unless it already exists.
    pub async fn create_schema(&self) -> WarehouseResult<()> {
        let row = self
            .executor()
            .fetch_one(
                sqlx::query(
                    "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)",
                )
                .bind(&self.namespace),
            )
            .await?;
        let exists: bool = row.try_get(0)?;

        if exists {
            info!(namespace = %self.namespace, "schema already exists, skipping creation");
            return Ok(());
        }

        let statement = format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_identifier(&self.namespace)
        );
        info!(namespace = %self.namespace, statement = %statement, "creating schema");
        self.executor().execute(&statement).await?;

        Ok(())
    }

    pub async fn create_table(&self, table: &str, schema: &TableSchema) -> WarehouseResult<()> {
        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            TableName::new(&self.namespace, table).as_quoted_identifier(),
            columns_with_data_types(schema)
        );
        info!(table, statement = %statement, "creating table");
        self.executor().execute(&statement).await?;

        Ok(())
    }

    /// Adds the missing `columns` to `table`. Existing columns are left untouched.
    pub async fn add_columns(&self, table: &str, columns: &TableSchema) -> WarehouseResult<()> {
        if columns.is_empty() {
            return Ok(());
        }

        let statement = add_columns_statement(&self.namespace, table, columns);
        info!(table, statement = %statement, "adding columns");
        self.executor().execute(&statement).await?;

        Ok(())
    }

    pub async fn drop_table(&self, table: &str) -> WarehouseResult<()> {
        let statement = format!(
            "DROP TABLE {}",
            TableName::new(&self.namespace, table).as_quoted_identifier()
        );
        info!(table, "dropping table");
        self.executor().execute(&statement).await?;

        Ok(())
    }

    pub async fn total_count_in_table(&self, table: &str) -> WarehouseResult<i64> {
        let statement = format!(
            "SELECT count(*) FROM {}",
            TableName::new(&self.namespace, table).as_quoted_identifier()
        );
        let row = self.executor().fetch_one(sqlx::query(&statement)).await?;

        Ok(row.try_get(0)?)
    }

    /// Drops a staging table if it exists. Failures are logged and swallowed.
    pub async fn drop_staging_table(&self, staging_table: &str) {
        let statement = format!(
            "DROP TABLE IF EXISTS {}",
            TableName::new(&self.namespace, staging_table).as_quoted_identifier()
        );
        debug!(staging_table, "dropping staging table");

        if let Err(err) = self.executor().execute(&statement).await {
            error!(staging_table, error = %err, "failed to drop staging table");
        }
    }

    /// Reads the columns of every table in the namespace, staging tables excluded.
    ///
    /// Columns whose native type has no canonical mapping are returned separately, keyed by
    /// table, with their native type.
    pub async fn fetch_schema(&self) -> WarehouseResult<(Schema, UnrecognizedSchema)> {
        let prefix_pattern = format!("{}%", escape_like_pattern(&staging_table_prefix(PROVIDER)));
        let rows = self
            .executor()
            .fetch_all(
                sqlx::query(
                    "SELECT table_name::text, column_name::text, data_type::text FROM information_schema.columns WHERE table_schema = $1 AND table_name NOT LIKE $2",
                )
                .bind(&self.namespace)
                .bind(prefix_pattern),
            )
            .await?;

        let mut schema = Schema::new();
        let mut unrecognized = UnrecognizedSchema::new();
        for row in rows {
            let table: String = row.try_get(0)?;
            let column: String = row.try_get(1)?;
            let native: String = row.try_get(2)?;

            match DataType::from_postgres(&native) {
                Some(data_type) => {
                    schema.entry(table).or_default().insert(column, data_type);
                }
                None => {
                    warn!(
                        table = %table,
                        column = %column,
                        datatype = %native,
                        "column type is not recognized"
                    );
                    metrics::counter!(
                        WH_MISSING_DATATYPE_TOTAL,
                        WORKSPACE_ID_LABEL => self.workspace_id.clone(),
                        DESTINATION_ID_LABEL => self.destination_id.clone(),
                        DATATYPE_LABEL => native.clone(),
                    )
                    .increment(1);
                    unrecognized.entry(table).or_default().insert(column, native);
                }
            }
        }

        Ok((schema, unrecognized))
    }

    /// Deletes stale rows of a previous sync run from `tables`.
    ///
    /// Does nothing unless `enable_delete_by_jobs` is set.
    pub async fn delete_by(&self, tables: &[&str], params: &DeleteByParams) -> WarehouseResult<()> {
        info!(
            ?tables,
            job_run_id = %params.job_run_id,
            task_run_id = %params.task_run_id,
            source_id = %params.source_id,
            start_time = %params.start_time,
            "cleaning up tables"
        );

        if !self.loader.enable_delete_by_jobs {
            info!("delete by jobs is disabled, skipping");
            return Ok(());
        }

        for table in tables {
            let statement = delete_by_statement(&self.namespace, table);
            debug!(table, statement = %statement, "deleting rows");

            let deleted = self
                .executor()
                .execute_query(
                    sqlx::query(&statement)
                        .bind(&params.job_run_id)
                        .bind(&params.task_run_id)
                        .bind(&params.source_id)
                        .bind(params.start_time),
                )
                .await?;
            info!(table, deleted, "deleted rows");
        }

        Ok(())
    }

    /// Checks that a connection can be acquired and answers a ping.
    pub async fn test_connection(&self) -> WarehouseResult<()> {
        let ping = async {
            let mut connection = self.pool.acquire().await?;
            connection.ping().await
        };

        let result = match self.loader.connect_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, ping).await {
                Ok(result) => result,
                Err(_) => bail!(
                    ErrorKind::ConnectionFailed,
                    "Connection timeout",
                    format!("no response from the warehouse within {timeout:?}")
                ),
            },
            None => ping.await,
        };
        result?;

        Ok(())
    }
}
