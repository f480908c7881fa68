//! Bulk-load and merge engine for Postgres warehouses.
//!
//! Load files are streamed into a per-load staging table with `COPY`, merged into the
//! destination table with a delete-then-insert dedup inside the same transaction, and the
//! staging table is dropped afterwards. The `users` table is derived from `identifies` by the
//! identity merge, and leftover staging tables from crashed loads are swept on startup.

pub mod classifier;
pub mod copy;
pub mod core;
pub mod decoder;
pub mod error;
pub mod executor;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod identity;
mod macros;
pub mod management;
pub mod merge;
pub mod metrics;
pub mod rollback;
pub mod source;
pub mod staging;
pub mod sweeper;
pub mod tags;
#[cfg(feature = "test-utils")]
pub mod test_utils;

/// Provider tag of this dialect, embedded in staging table names.
pub const PROVIDER: &str = "postgres";

/// Event timestamp column present on every loaded table, used to pick the most recent row.
pub const RECENCY_COLUMN: &str = "received_at";

pub const USERS_TABLE: &str = "users";
pub const IDENTIFIES_TABLE: &str = "identifies";
pub const DISCARDS_TABLE: &str = "rudder_discards";

/// Logical name of the intermediate table unioning users with new identifies.
pub const USERS_IDENTIFIES_UNION: &str = "users_identifies_union";
