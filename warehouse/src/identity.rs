//! Identity resolution merge of the `identifies` and `users` tables.
//!
//! `users` is a snapshot keyed by user id holding, per attribute, the most recent non-null
//! value seen across the previous snapshot and every identify event of the upload. Only
//! users touched by the upload are recomputed.

use config::shared::DedupKey;
use pg_escape::quote_identifier;
use postgres::schema::{TableName, quote_columns};
use postgres::types::TableSchema;
use sqlx::PgConnection;
use tracing::{error, info};

use crate::core::PostgresWarehouse;
use crate::error::{ErrorKind, LoadStage, WarehouseError, WarehouseResult};
use crate::executor::Executor;
use crate::merge::delete_dedup_statement;
use crate::rollback::run_rollback_with_timeout;
use crate::source::LoadFileSource;
use crate::staging::{StagingCleanup, staging_table_name};
use crate::{
    IDENTIFIES_TABLE, PROVIDER, RECENCY_COLUMN, USERS_IDENTIFIES_UNION, USERS_TABLE, bail,
};

/// Key column of the users table.
pub const USER_ID_COLUMN: &str = "id";

/// Column of the identifies table referencing [`USER_ID_COLUMN`].
pub const IDENTIFIES_USER_ID_COLUMN: &str = "user_id";

/// Outcome of [`PostgresWarehouse::load_user_tables`], per table.
#[derive(Debug)]
pub struct UserTablesLoad {
    pub identifies: WarehouseResult<()>,
    /// `None` when the users table was not attempted.
    pub users: Option<WarehouseResult<()>>,
}

impl UserTablesLoad {
    /// Collapses both outcomes, aggregating the errors when both tables failed.
    pub fn into_result(self) -> WarehouseResult<()> {
        let mut errors = Vec::new();
        if let Err(err) = self.identifies {
            errors.push(err);
        }
        if let Some(Err(err)) = self.users {
            errors.push(err);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(WarehouseError::from(errors))
        }
    }
}

/// Attribute columns of the users table: every column but the key, sorted.
pub fn user_attribute_columns(users_schema: &TableSchema) -> Vec<&str> {
    users_schema
        .keys()
        .map(String::as_str)
        .filter(|column| *column != USER_ID_COLUMN)
        .collect()
}

/// Creates `union_table` from the existing users touched by the identifies staging table
/// plus every identify event carrying a user id.
pub fn union_statement(
    namespace: &str,
    identifies_staging_table: &str,
    union_table: &str,
    columns: &[&str],
) -> String {
    let users = TableName::new(namespace, USERS_TABLE).as_quoted_identifier();
    let identifies = TableName::new(namespace, identifies_staging_table).as_quoted_identifier();
    let union = TableName::new(namespace, union_table).as_quoted_identifier();
    let columns = quote_columns(columns.iter().copied());

    format!(
        "CREATE TABLE {union} AS ((SELECT {USER_ID_COLUMN}, {columns} FROM {users} WHERE {USER_ID_COLUMN} IN (SELECT {IDENTIFIES_USER_ID_COLUMN} FROM {identifies} WHERE {IDENTIFIES_USER_ID_COLUMN} IS NOT NULL)) UNION (SELECT {IDENTIFIES_USER_ID_COLUMN}, {columns} FROM {identifies} WHERE {IDENTIFIES_USER_ID_COLUMN} IS NOT NULL))"
    )
}

/// Creates `users_staging_table` with one row per user id, each attribute set to its most
/// recent non-null value in `union_table`.
///
/// Every column is resolved by its own correlated subquery since columns may become null at
/// different points in time.
pub fn latest_traits_statement(
    namespace: &str,
    union_table: &str,
    users_staging_table: &str,
    columns: &[&str],
) -> String {
    let union = TableName::new(namespace, union_table).as_quoted_identifier();
    let staging = TableName::new(namespace, users_staging_table).as_quoted_identifier();
    let recency = quote_identifier(RECENCY_COLUMN);

    let latest_values = columns
        .iter()
        .map(|column| {
            let column = quote_identifier(column);
            format!(
                "(SELECT _latest.{column} FROM {union} AS _latest WHERE _latest.{USER_ID_COLUMN} = _union.{USER_ID_COLUMN} AND _latest.{column} IS NOT NULL ORDER BY _latest.{recency} DESC LIMIT 1) AS {column}"
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE {staging} AS (SELECT DISTINCT * FROM (SELECT _union.{USER_ID_COLUMN}, {latest_values} FROM {union} AS _union) AS _traits)"
    )
}

/// Deletes the users recomputed in `users_staging_table`, matching on `dedup_key`.
pub fn users_delete_statement(
    namespace: &str,
    users_staging_table: &str,
    dedup_key: &DedupKey,
) -> String {
    delete_dedup_statement(namespace, USERS_TABLE, users_staging_table, dedup_key)
}

/// Inserts every row of `users_staging_table` into the users table.
pub fn users_insert_statement(
    namespace: &str,
    users_staging_table: &str,
    columns: &[&str],
) -> String {
    let users = TableName::new(namespace, USERS_TABLE).as_quoted_identifier();
    let staging = TableName::new(namespace, users_staging_table).as_quoted_identifier();
    let columns = quote_columns(std::iter::once(USER_ID_COLUMN).chain(columns.iter().copied()));

    format!("INSERT INTO {users} ({columns}) SELECT {columns} FROM {staging}")
}

impl<S> PostgresWarehouse<S>
where
    S: LoadFileSource,
{
    /// Loads `identifies` and derives `users` from it.
    ///
    /// `users` is only attempted when `identifies` loaded and the upload carries users
    /// columns. Every staging table created here is dropped before returning.
    pub async fn load_user_tables(&self) -> UserTablesLoad {
        info!(namespace = %self.namespace, "starting load for identifies and users tables");

        let identifies_schema = self.source.table_schema_in_upload(IDENTIFIES_TABLE);
        let identifies_staging_table = staging_table_name(PROVIDER, IDENTIFIES_TABLE);

        let identifies = self
            .load_table_with_staging(
                IDENTIFIES_TABLE,
                &identifies_schema,
                &identifies_staging_table,
                StagingCleanup::Defer,
            )
            .await
            .map(|_| ());

        let users = if identifies.is_err() {
            None
        } else {
            self.load_users_table(&identifies_staging_table).await
        };

        self.drop_staging_table(&identifies_staging_table).await;

        UserTablesLoad { identifies, users }
    }

    async fn load_users_table(
        &self,
        identifies_staging_table: &str,
    ) -> Option<WarehouseResult<()>> {
        if self.source.table_schema_in_upload(USERS_TABLE).is_empty() {
            info!("no users columns in upload, skipping users table");
            return None;
        }

        if self.loader.skip_user_latest_traits(&self.workspace_id) {
            info!("skipping latest traits computation for users table");
            return Some(self.load_table(USERS_TABLE).await);
        }

        let union_table = staging_table_name(PROVIDER, USERS_IDENTIFIES_UNION);
        let users_staging_table = staging_table_name(PROVIDER, USERS_TABLE);

        let result = self
            .merge_users(identifies_staging_table, &union_table, &users_staging_table)
            .await;
        if let Err(err) = &result {
            error!(
                stage = err.stage().map(|stage| stage.as_str()),
                error = %err,
                "failed to merge users table"
            );
        }

        self.drop_staging_table(&users_staging_table).await;
        self.drop_staging_table(&union_table).await;

        Some(result)
    }

    async fn merge_users(
        &self,
        identifies_staging_table: &str,
        union_table: &str,
        users_staging_table: &str,
    ) -> WarehouseResult<()> {
        let users_schema = self.source.table_schema_in_warehouse(USERS_TABLE);
        let columns = user_attribute_columns(&users_schema);
        if columns.is_empty() {
            bail!(
                ErrorKind::InvalidState,
                "Users table has no attribute columns",
                format!("namespace {} has no users columns in the warehouse", self.namespace)
            );
        }

        let mut executor = self.executor();

        let union = union_statement(
            &self.namespace,
            identifies_staging_table,
            union_table,
            &columns,
        );
        info!(statement = %union, "creating union of users and identifies");
        executor.execute(&union).await?;

        let latest_traits =
            latest_traits_statement(&self.namespace, union_table, users_staging_table, &columns);
        info!(statement = %latest_traits, "computing latest user traits");
        executor.execute(&latest_traits).await?;

        let mut transaction = self.pool.begin().await?;
        let replaced = self
            .replace_users(&mut transaction, users_staging_table, &columns)
            .await;
        if let Err(err) = replaced {
            let tags = self.load_tags(USERS_TABLE).with_stage(err.stage());
            run_rollback_with_timeout(
                transaction.rollback(),
                self.loader.txn_rollback_timeout(),
                &tags,
            )
            .await;
            return Err(err);
        }

        transaction
            .commit()
            .await
            .map_err(|err| WarehouseError::from(err).with_stage(LoadStage::DedupCommit))?;

        info!("completed load for users table");

        Ok(())
    }

    async fn replace_users(
        &self,
        connection: &mut PgConnection,
        users_staging_table: &str,
        columns: &[&str],
    ) -> WarehouseResult<()> {
        let explain = self.explain_enabled();
        let mut executor = Executor::transactional(connection, self.slow_query_threshold());

        let delete = users_delete_statement(
            &self.namespace,
            users_staging_table,
            self.dedup_keys.get(USERS_TABLE),
        );
        info!(table = USERS_TABLE, statement = %delete, "deduplicating records");
        executor
            .execute_with_plan(&delete, explain)
            .await
            .map_err(|err| err.with_stage(LoadStage::DedupDeletion))?;

        let insert = users_insert_statement(&self.namespace, users_staging_table, columns);
        info!(table = USERS_TABLE, statement = %insert, "inserting records");
        executor
            .execute_with_plan(&insert, explain)
            .await
            .map_err(|err| err.with_stage(LoadStage::DedupInsertion))?;

        Ok(())
    }
}
