use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Logical row identity of a table for merge purposes.
///
/// Rows of the destination table that share the [`DedupKey::primary_key`] value (and the value
/// of every additional partition column) with a staged row are replaced by the most recent
/// staged row of their partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DedupKey {
    pub primary_key: String,
    pub partition_key: Vec<String>,
}

impl DedupKey {
    pub fn new(primary_key: impl Into<String>, partition_key: &[&str]) -> Self {
        Self {
            primary_key: primary_key.into(),
            partition_key: partition_key.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Partition columns, other than the primary key, that must also match when deleting.
    pub fn additional_join_columns(&self) -> impl Iterator<Item = &str> {
        self.partition_key
            .iter()
            .map(String::as_str)
            .filter(|column| *column != self.primary_key)
    }

    fn validate(&self, table: &str) -> Result<(), ValidationError> {
        if self.primary_key.is_empty() {
            return Err(ValidationError::InvalidDedupKey {
                table: table.to_string(),
                reason: "`primary_key` cannot be empty".to_string(),
            });
        }
        if self.partition_key.is_empty() {
            return Err(ValidationError::InvalidDedupKey {
                table: table.to_string(),
                reason: "`partition_key` needs at least one column".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for DedupKey {
    fn default() -> Self {
        DedupKey::new("id", &["id"])
    }
}

/// Behavior switches of the Postgres load engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoaderConfig {
    /// Loads the users table as-is instead of computing the latest non-null traits.
    #[serde(default)]
    pub skip_computing_user_latest_traits: bool,
    #[serde(default)]
    pub skip_computing_user_latest_traits_workspace_ids: Vec<String>,
    /// Logs the `EXPLAIN` output of every dedup statement.
    #[serde(default)]
    pub enable_sql_statement_execution_plan: bool,
    #[serde(default)]
    pub enable_sql_statement_execution_plan_workspace_ids: Vec<String>,
    /// Enables the retention delete path.
    #[serde(default)]
    pub enable_delete_by_jobs: bool,
    #[serde(default = "default_txn_rollback_timeout_ms")]
    pub txn_rollback_timeout_ms: u64,
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,
    /// Upper bound for acquiring a connection from the pool.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Per-table dedup keys, overriding the built-in ones.
    #[serde(default)]
    pub dedup_keys: BTreeMap<String, DedupKey>,
}

impl LoaderConfig {
    pub const DEFAULT_TXN_ROLLBACK_TIMEOUT_MS: u64 = 30_000;

    pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 5 * 60 * 1_000;

    pub fn txn_rollback_timeout(&self) -> Duration {
        Duration::from_millis(self.txn_rollback_timeout_ms)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Whether the users table should skip the latest-traits computation for `workspace_id`.
    pub fn skip_user_latest_traits(&self, workspace_id: &str) -> bool {
        self.skip_computing_user_latest_traits
            || self
                .skip_computing_user_latest_traits_workspace_ids
                .iter()
                .any(|id| id == workspace_id)
    }

    /// Whether dedup statements should log their execution plan for `workspace_id`.
    pub fn execution_plan_enabled(&self, workspace_id: &str) -> bool {
        self.enable_sql_statement_execution_plan
            || self
                .enable_sql_statement_execution_plan_workspace_ids
                .iter()
                .any(|id| id == workspace_id)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.txn_rollback_timeout_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "loader.txn_rollback_timeout_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        for (table, key) in &self.dedup_keys {
            key.validate(table)?;
        }

        Ok(())
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            skip_computing_user_latest_traits: false,
            skip_computing_user_latest_traits_workspace_ids: Vec::new(),
            enable_sql_statement_execution_plan: false,
            enable_sql_statement_execution_plan_workspace_ids: Vec::new(),
            enable_delete_by_jobs: false,
            txn_rollback_timeout_ms: default_txn_rollback_timeout_ms(),
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
            connect_timeout_ms: None,
            dedup_keys: BTreeMap::new(),
        }
    }
}

fn default_txn_rollback_timeout_ms() -> u64 {
    LoaderConfig::DEFAULT_TXN_ROLLBACK_TIMEOUT_MS
}

fn default_slow_query_threshold_ms() -> u64 {
    LoaderConfig::DEFAULT_SLOW_QUERY_THRESHOLD_MS
}
