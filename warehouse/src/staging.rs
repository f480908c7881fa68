//! Staging table naming and the transactional load of one table.
//!
//! A load creates a staging table shaped like the destination, streams every load file into
//! it with `COPY`, merges it into the destination and commits, all in one transaction. Any
//! failure rolls the transaction back, leaving the destination untouched.

use std::time::Instant;

use postgres::schema::TableName;
use postgres::types::TableSchema;
use sqlx::PgConnection;
use sqlx::postgres::PgCopyIn;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::PROVIDER;
use crate::bail;
use crate::copy::{CopyEncoder, copy_in_statement};
use crate::core::PostgresWarehouse;
use crate::decoder::RowDecoder;
use crate::error::{ErrorKind, LoadStage, WarehouseError, WarehouseResult};
use crate::executor::Executor;
use crate::merge::{MergeTarget, merge_staging_table};
use crate::metrics::{WH_PG_LOAD_TABLE_DURATION_SECONDS, WH_PG_ROWS_STAGED_TOTAL};
use crate::rollback::run_rollback_with_timeout;
use crate::source::{LoadFileSource, LocalLoadFiles};
use crate::tags::LoadTags;

/// Maximum identifier length in bytes; Postgres silently truncates longer names.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

const STAGING_TABLE_PREFIX: &str = "wh_staging";

/// Length of the hex encoded random suffix.
const SUFFIX_LENGTH: usize = 32;

/// Returns the prefix shared by every staging table of `provider`, e.g. `wh_staging_postgres_`.
pub fn staging_table_prefix(provider: &str) -> String {
    format!("{STAGING_TABLE_PREFIX}_{}_", provider.to_lowercase())
}

/// Returns a fresh staging table name `<prefix><table>_<random hex>`.
///
/// The table part is shortened so the name fits [`MAX_IDENTIFIER_LENGTH`] with the random
/// suffix intact.
pub fn staging_table_name(provider: &str, table: &str) -> String {
    let prefix = staging_table_prefix(provider);
    let room = MAX_IDENTIFIER_LENGTH.saturating_sub(prefix.len() + 1 + SUFFIX_LENGTH);

    let mut end = table.len().min(room);
    while !table.is_char_boundary(end) {
        end -= 1;
    }

    format!("{prefix}{}_{}", &table[..end], Uuid::new_v4().simple())
}

/// Whether the staging table is dropped once the load returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingCleanup {
    Drop,
    /// Keeps the staging table; the caller becomes responsible for dropping it.
    Defer,
}

impl<S> PostgresWarehouse<S>
where
    S: LoadFileSource,
{
    /// Loads `table` using its upload schema and drops the staging table afterwards.
    pub async fn load_table(&self, table: &str) -> WarehouseResult<()> {
        let upload_schema = self.source.table_schema_in_upload(table);
        let staging_table = staging_table_name(PROVIDER, table);

        self.load_table_with_staging(table, &upload_schema, &staging_table, StagingCleanup::Drop)
            .await
            .map(|_| ())
    }

    /// Stages the load files of `table` into `staging_table`, merges them into `table` and
    /// commits. Returns the number of staged rows.
    ///
    /// Load file columns are expected in the sorted column order of `upload_schema`. Local
    /// copies of the load files are deleted before returning.
    pub async fn load_table_with_staging(
        &self,
        table: &str,
        upload_schema: &TableSchema,
        staging_table: &str,
        cleanup: StagingCleanup,
    ) -> WarehouseResult<u64> {
        let started = Instant::now();
        let tags = self.load_tags(table);
        info!(table, namespace = %self.namespace, staging_table, "starting load for table");

        let result = self
            .stage_and_merge(table, upload_schema, staging_table, &tags)
            .await;

        if cleanup == StagingCleanup::Drop {
            self.drop_staging_table(staging_table).await;
        }

        match &result {
            Ok(rows) => {
                metrics::histogram!(WH_PG_LOAD_TABLE_DURATION_SECONDS, tags.labels())
                    .record(started.elapsed().as_secs_f64());
                info!(table, rows, "completed load for table");
            }
            Err(err) => {
                error!(
                    table,
                    stage = err.stage().map(|stage| stage.as_str()),
                    error = %err,
                    "failed to load table"
                );
            }
        }

        result
    }

    async fn stage_and_merge(
        &self,
        table: &str,
        upload_schema: &TableSchema,
        staging_table: &str,
        tags: &LoadTags,
    ) -> WarehouseResult<u64> {
        if upload_schema.is_empty() {
            bail!(
                ErrorKind::InvalidState,
                "Upload schema has no columns",
                format!("table {table} has no columns in the upload schema")
            );
        }
        let columns: Vec<&str> = upload_schema.keys().map(String::as_str).collect();

        // Downloads happen before the transaction so download failures mutate nothing.
        let files = self.source.download_load_files(table).await?;

        let mut transaction = self.pool.begin().await?;
        let staged = self
            .stage_and_merge_in_transaction(
                &mut transaction,
                table,
                &columns,
                &files,
                staging_table,
                tags,
            )
            .await;
        let rows = match staged {
            Ok(rows) => rows,
            Err(err) => {
                let tags = tags.with_stage(err.stage());
                run_rollback_with_timeout(
                    transaction.rollback(),
                    self.loader.txn_rollback_timeout(),
                    &tags,
                )
                .await;
                return Err(err);
            }
        };

        // A failed commit has already ended the transaction server side.
        transaction.commit().await.map_err(|err| {
            error!(table, staging_table, error = %err, "failed to commit load transaction");
            WarehouseError::from(err).with_stage(LoadStage::DedupCommit)
        })?;

        Ok(rows)
    }

    async fn stage_and_merge_in_transaction(
        &self,
        connection: &mut PgConnection,
        table: &str,
        columns: &[&str],
        files: &LocalLoadFiles,
        staging_table: &str,
        tags: &LoadTags,
    ) -> WarehouseResult<u64> {
        let destination = TableName::new(&self.namespace, table);
        let staging = TableName::new(&self.namespace, staging_table);

        let create = format!(
            "CREATE TABLE {} (LIKE {})",
            staging.as_quoted_identifier(),
            destination.as_quoted_identifier()
        );
        debug!(table, statement = %create, "creating staging table");
        Executor::transactional(&mut *connection, self.slow_query_threshold())
            .execute(&create)
            .await
            .map_err(|err| err.with_stage(LoadStage::StagingTableCreation))?;

        let rows = self
            .copy_into_staging(&mut *connection, table, staging_table, columns, files)
            .await?;
        metrics::counter!(WH_PG_ROWS_STAGED_TOTAL, tags.labels()).increment(rows);

        #[cfg(feature = "failpoints")]
        crate::failpoints::warehouse_fail_point(crate::failpoints::LOAD_TABLE_BEFORE_DEDUP)?;

        let target = MergeTarget {
            namespace: &self.namespace,
            table,
            staging_table,
            columns,
            dedup_key: self.dedup_keys.get(table),
        };
        let mut executor = Executor::transactional(connection, self.slow_query_threshold());
        merge_staging_table(&mut executor, &target, self.explain_enabled()).await?;

        Ok(rows)
    }

    async fn copy_into_staging(
        &self,
        connection: &mut PgConnection,
        table: &str,
        staging_table: &str,
        columns: &[&str],
        files: &LocalLoadFiles,
    ) -> WarehouseResult<u64> {
        let statement = copy_in_statement(&self.namespace, staging_table, columns);
        let mut copy = connection
            .copy_in_raw(&statement)
            .await
            .map_err(|err| WarehouseError::from(err).with_stage(LoadStage::CopyInSchema))?;

        if let Err(err) = stream_load_files(&mut copy, table, columns.len(), files).await {
            if let Err(abort_err) = copy.abort(err.description().to_string()).await {
                debug!(table, error = %abort_err, "copy aborted");
            }
            return Err(err);
        }

        copy.finish()
            .await
            .map_err(|err| WarehouseError::from(err).with_stage(LoadStage::StagingTableLoadStage))
    }
}

/// Decodes every load file and streams its rows into `copy`, one file at a time.
async fn stream_load_files(
    copy: &mut PgCopyIn<&mut PgConnection>,
    table: &str,
    expected_columns: usize,
    files: &LocalLoadFiles,
) -> WarehouseResult<()> {
    let mut encoder = CopyEncoder::new();

    for path in files.paths() {
        let mut decoder = RowDecoder::open_gzip(path, expected_columns, table)?;
        for row in decoder.by_ref() {
            encoder.encode_row(&row?);
            if encoder.should_flush() {
                send(copy, &mut encoder).await?;
            }
        }
        debug!(
            table,
            path = %path.display(),
            rows = decoder.rows_processed(),
            "load file streamed"
        );
    }

    if !encoder.is_empty() {
        send(copy, &mut encoder).await?;
    }

    Ok(())
}

async fn send(
    copy: &mut PgCopyIn<&mut PgConnection>,
    encoder: &mut CopyEncoder,
) -> WarehouseResult<()> {
    copy.send(encoder.take())
        .await
        .map_err(|err| WarehouseError::from(err).with_stage(LoadStage::StagingTableLoading))?;

    Ok(())
}
