use config::shared::{LoaderConfig, LoaderServiceConfig, PgConnectionConfig, WarehouseConfig};
use postgres::types::TableSchema;
use tracing::{debug, error, info, warn};
use warehouse::classifier::classify;
use warehouse::core::PostgresWarehouse;
use warehouse::error::{WarehouseError, WarehouseResult};
use warehouse::source::{LoadFileSource, LocalDirectorySource};
use warehouse::{IDENTIFIES_TABLE, USERS_TABLE};

use crate::error::LoaderResult;

/// Runs one load of every configured table into the warehouse.
///
/// Verifies the connection, ensures the namespace exists, sweeps staging tables left behind by
/// crashed loads and evolves destination tables to the upload schema before loading. Staging
/// tables are swept again and the pool is closed whatever the outcome of the loads.
pub async fn start_loader_with_config(config: LoaderServiceConfig) -> LoaderResult<()> {
    info!("starting loader");

    log_config(&config);

    let source = LocalDirectorySource::open(&config.load_files_dir)?;
    let mut warehouse =
        PostgresWarehouse::connect(&config.warehouse, config.loader.clone(), source).await?;

    let result = run_load(&mut warehouse, &config.tables).await;

    warehouse.cleanup().await;

    result?;

    info!("loader finished");

    Ok(())
}

async fn run_load(
    warehouse: &mut PostgresWarehouse<LocalDirectorySource>,
    tables: &[String],
) -> WarehouseResult<()> {
    warehouse.test_connection().await?;
    warehouse.create_schema().await?;
    warehouse.crash_recover().await;

    prepare_tables(warehouse, tables).await?;
    load_tables(warehouse, tables).await
}

/// Creates missing destination tables and adds missing columns, then refreshes the cached
/// warehouse schema.
async fn prepare_tables(
    warehouse: &mut PostgresWarehouse<LocalDirectorySource>,
    tables: &[String],
) -> WarehouseResult<()> {
    let (schema, unrecognized) = warehouse.fetch_schema().await?;
    for (table, columns) in &unrecognized {
        warn!(
            table = %table,
            columns = ?columns.keys().collect::<Vec<_>>(),
            "unrecognized column types"
        );
    }

    let mut targets: Vec<&str> = tables.iter().map(String::as_str).collect();
    if targets.contains(&IDENTIFIES_TABLE) && !targets.contains(&USERS_TABLE) {
        targets.push(USERS_TABLE);
    }

    for table in targets {
        let upload_schema = warehouse.source().table_schema_in_upload(table);
        if upload_schema.is_empty() {
            debug!(table, "no upload schema, table left as-is");
            continue;
        }

        match schema.get(table) {
            None => {
                info!(table, "creating destination table");
                warehouse.create_table(table, &upload_schema).await?;
            }
            Some(existing) => {
                let missing: TableSchema = upload_schema
                    .into_iter()
                    .filter(|(column, _)| !existing.contains_key(column))
                    .collect();
                if !missing.is_empty() {
                    info!(table, columns = missing.len(), "adding columns");
                    warehouse.add_columns(table, &missing).await?;
                }
            }
        }
    }

    let (schema, _) = warehouse.fetch_schema().await?;
    warehouse.source_mut().set_warehouse_schema(schema);

    Ok(())
}

/// Loads every table in order, continuing past failures.
///
/// `users` is derived from `identifies` whenever both are loaded.
async fn load_tables(
    warehouse: &PostgresWarehouse<LocalDirectorySource>,
    tables: &[String],
) -> WarehouseResult<()> {
    let has_identifies = tables.iter().any(|table| table == IDENTIFIES_TABLE);
    let mut errors = Vec::new();

    for table in tables {
        let result = match table.as_str() {
            IDENTIFIES_TABLE => warehouse.load_user_tables().await.into_result(),
            USERS_TABLE if has_identifies => continue,
            _ => warehouse.load_table(table).await,
        };

        match result {
            Ok(()) => info!(table = %table, "table loaded"),
            Err(err) => {
                log_load_error(table, &err);
                errors.push(err);
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(WarehouseError::from(errors))
    }
}

fn log_load_error(table: &str, err: &WarehouseError) {
    let job_error = classify(&err.classification_text());
    error!(
        table,
        error_type = %job_error,
        stage = ?err.stage(),
        "table load failed: {err}"
    );
}

fn log_config(config: &LoaderServiceConfig) {
    debug!(
        load_files_dir = %config.load_files_dir.display(),
        tables = ?config.tables,
        "load config"
    );
    log_warehouse_config(&config.warehouse);
    log_loader_config(&config.loader);
}

fn log_warehouse_config(config: &WarehouseConfig) {
    debug!(
        workspace_id = config.workspace_id,
        destination_id = config.destination_id,
        namespace = config.namespace,
        "warehouse config"
    );
    log_pg_connection_config(&config.connection);
}

fn log_pg_connection_config(config: &PgConnectionConfig) {
    debug!(
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        tls_enabled = config.tls.enabled,
        "warehouse postgres connection config",
    );
}

fn log_loader_config(config: &LoaderConfig) {
    debug!(
        skip_computing_user_latest_traits = config.skip_computing_user_latest_traits,
        enable_delete_by_jobs = config.enable_delete_by_jobs,
        txn_rollback_timeout_ms = config.txn_rollback_timeout_ms,
        slow_query_threshold_ms = config.slow_query_threshold_ms,
        dedup_key_overrides = config.dedup_keys.len(),
        "loader config"
    );
}
