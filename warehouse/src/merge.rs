//! Dedup merge of a loaded staging table into its destination table.
//!
//! Destination rows sharing a key with any staged row are deleted, then the most recent staged
//! row of every partition is inserted. Both statements run in the caller's transaction.

use std::collections::BTreeMap;

use config::shared::DedupKey;
use pg_escape::quote_identifier;
use postgres::schema::{TableName, quote_columns};
use tracing::info;

use crate::error::{LoadStage, WarehouseResult};
use crate::executor::Executor;
use crate::{DISCARDS_TABLE, IDENTIFIES_TABLE, RECENCY_COLUMN, USERS_TABLE};

/// Alias of the row number computed over each partition of the staging table.
pub const ROW_NUMBER_COLUMN: &str = "_staging_row_number";

/// Alias of the staging table in the dedup delete.
const SOURCE_ALIAS: &str = "_source";

/// Per-table dedup keys with a fallback for tables without an entry.
#[derive(Debug, Clone)]
pub struct DedupKeys {
    keys: BTreeMap<String, DedupKey>,
    fallback: DedupKey,
}

impl DedupKeys {
    /// Keys of the tables with a known row identity.
    pub fn builtin() -> Self {
        let keys = BTreeMap::from([
            (USERS_TABLE.to_string(), DedupKey::new("id", &["id"])),
            (IDENTIFIES_TABLE.to_string(), DedupKey::new("id", &["id"])),
            (
                DISCARDS_TABLE.to_string(),
                DedupKey::new("row_id", &["row_id", "column_name", "table_name"]),
            ),
        ]);

        Self {
            keys,
            fallback: DedupKey::default(),
        }
    }

    /// Built-in keys with `overrides` taking precedence.
    pub fn with_overrides(overrides: &BTreeMap<String, DedupKey>) -> Self {
        let mut keys = Self::builtin();
        keys.keys
            .extend(overrides.iter().map(|(table, key)| (table.clone(), key.clone())));
        keys
    }

    pub fn get(&self, table: &str) -> &DedupKey {
        self.keys.get(table).unwrap_or(&self.fallback)
    }
}

impl Default for DedupKeys {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Deletes destination rows whose key matches a staged row.
///
/// The join always covers the primary key plus every other partition column.
pub fn delete_dedup_statement(
    namespace: &str,
    table: &str,
    staging_table: &str,
    dedup_key: &DedupKey,
) -> String {
    let destination = TableName::new(namespace, table);
    let staging = TableName::new(namespace, staging_table);

    let conditions = std::iter::once(dedup_key.primary_key.as_str())
        .chain(dedup_key.additional_join_columns())
        .map(|column| {
            format!(
                "{SOURCE_ALIAS}.{} = {}",
                quote_identifier(column),
                destination.quoted_column(column)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    format!(
        "DELETE FROM {} USING {} AS {SOURCE_ALIAS} WHERE ({conditions})",
        destination.as_quoted_identifier(),
        staging.as_quoted_identifier(),
    )
}

/// Inserts the most recent staged row of each partition.
///
/// Ties on the recency column are broken by whatever order the window produces.
pub fn insert_dedup_statement(
    namespace: &str,
    table: &str,
    staging_table: &str,
    columns: &[&str],
    dedup_key: &DedupKey,
) -> String {
    let destination = TableName::new(namespace, table);
    let staging = TableName::new(namespace, staging_table);
    let columns = quote_columns(columns.iter().copied());
    let partition = quote_columns(dedup_key.partition_key.iter().map(String::as_str));

    format!(
        "INSERT INTO {destination} ({columns}) SELECT {columns} FROM (SELECT *, row_number() OVER (PARTITION BY {partition} ORDER BY {recency} DESC) AS {ROW_NUMBER_COLUMN} FROM {staging}) AS _ WHERE {ROW_NUMBER_COLUMN} = 1",
        destination = destination.as_quoted_identifier(),
        staging = staging.as_quoted_identifier(),
        recency = quote_identifier(RECENCY_COLUMN),
    )
}

/// Destination and staging table of one merge.
#[derive(Debug)]
pub struct MergeTarget<'a> {
    pub namespace: &'a str,
    pub table: &'a str,
    pub staging_table: &'a str,
    pub columns: &'a [&'a str],
    pub dedup_key: &'a DedupKey,
}

/// Runs the dedup delete and insert on `executor`, tagging failures with their stage.
///
/// Returns the number of deleted and inserted rows.
pub async fn merge_staging_table(
    executor: &mut Executor<'_>,
    target: &MergeTarget<'_>,
    explain: bool,
) -> WarehouseResult<(u64, u64)> {
    let delete = delete_dedup_statement(
        target.namespace,
        target.table,
        target.staging_table,
        target.dedup_key,
    );
    info!(table = target.table, statement = %delete, "deduplicating records");
    let deleted = executor
        .execute_with_plan(&delete, explain)
        .await
        .map_err(|err| err.with_stage(LoadStage::DedupDeletion))?;

    let insert = insert_dedup_statement(
        target.namespace,
        target.table,
        target.staging_table,
        target.columns,
        target.dedup_key,
    );
    info!(table = target.table, statement = %insert, "inserting records");
    let inserted = executor
        .execute_with_plan(&insert, explain)
        .await
        .map_err(|err| err.with_stage(LoadStage::DedupInsertion))?;

    Ok((deleted, inserted))
}
