use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};

static REGISTER_METRICS: Once = Once::new();

/// Rollbacks abandoned because they did not finish within the rollback timeout.
/// Labels: load tags, including `stage`.
pub const WH_PG_ROLLBACK_TIMEOUT_TOTAL: &str = "wh_pg_rollback_timeout_total";

/// Duration of a complete table load, from download to commit.
/// Labels: load tags.
pub const WH_PG_LOAD_TABLE_DURATION_SECONDS: &str = "wh_pg_load_table_duration_seconds";

/// Rows streamed into staging tables.
/// Labels: load tags.
pub const WH_PG_ROWS_STAGED_TOTAL: &str = "wh_pg_rows_staged_total";

/// Staging tables dropped by the crash recovery sweep.
/// Labels: `workspace_id`, `destination_id`, `namespace`.
pub const WH_PG_DANGLING_STAGING_TABLES_DROPPED_TOTAL: &str =
    "wh_pg_dangling_staging_tables_dropped_total";

/// Warehouse columns whose native type has no canonical mapping.
/// Labels: `workspace_id`, `destination_id`, `datatype`.
pub const WH_MISSING_DATATYPE_TOTAL: &str = "wh_missing_datatype_total";

pub const WORKSPACE_ID_LABEL: &str = "workspace_id";
pub const NAMESPACE_LABEL: &str = "namespace";
pub const DESTINATION_ID_LABEL: &str = "destination_id";
pub const TABLE_NAME_LABEL: &str = "table_name";
pub const STAGE_LABEL: &str = "stage";
pub const DATATYPE_LABEL: &str = "datatype";

/// Registers metric descriptions. Safe to call multiple times.
pub fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            WH_PG_ROLLBACK_TIMEOUT_TOTAL,
            Unit::Count,
            "Transaction rollbacks that did not complete within the rollback timeout"
        );

        describe_histogram!(
            WH_PG_LOAD_TABLE_DURATION_SECONDS,
            Unit::Seconds,
            "Duration of staging, merging and committing one table"
        );

        describe_counter!(
            WH_PG_ROWS_STAGED_TOTAL,
            Unit::Count,
            "Rows copied into staging tables"
        );

        describe_counter!(
            WH_PG_DANGLING_STAGING_TABLES_DROPPED_TOTAL,
            Unit::Count,
            "Leftover staging tables dropped by crash recovery"
        );

        describe_counter!(
            WH_MISSING_DATATYPE_TOTAL,
            Unit::Count,
            "Warehouse columns with a native type that has no canonical mapping"
        );
    });
}
