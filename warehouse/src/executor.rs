//! Uniform statement execution against either the pool or an open transaction.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Execute, PgConnection, PgPool, Postgres};
use tracing::{debug, info, warn};

use crate::error::WarehouseResult;

enum Target<'c> {
    Pool(&'c PgPool),
    Transaction(&'c mut PgConnection),
}

/// Executes statements on a pool (each statement on its own connection, autocommit) or on the
/// connection of an open transaction.
///
/// Every statement is timed and statements slower than the configured threshold are logged.
pub struct Executor<'c> {
    target: Target<'c>,
    slow_query_threshold: Duration,
}

impl<'c> Executor<'c> {
    pub fn non_transactional(pool: &'c PgPool, slow_query_threshold: Duration) -> Self {
        Self {
            target: Target::Pool(pool),
            slow_query_threshold,
        }
    }

    pub fn transactional(connection: &'c mut PgConnection, slow_query_threshold: Duration) -> Self {
        Self {
            target: Target::Transaction(connection),
            slow_query_threshold,
        }
    }

    /// Executes a statement without bind parameters and returns the affected row count.
    pub async fn execute(&mut self, sql: &str) -> WarehouseResult<u64> {
        self.execute_query(sqlx::query(sql).persistent(false)).await
    }

    pub async fn execute_query<'q>(
        &mut self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> WarehouseResult<u64> {
        let sql = query.sql().to_owned();
        let started = Instant::now();

        let result = match &mut self.target {
            Target::Pool(pool) => query.execute(*pool).await?,
            Target::Transaction(connection) => query.execute(&mut **connection).await?,
        };

        record_duration(&sql, started.elapsed(), self.slow_query_threshold);

        Ok(result.rows_affected())
    }

    pub async fn fetch_all<'q>(
        &mut self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> WarehouseResult<Vec<PgRow>> {
        let sql = query.sql().to_owned();
        let started = Instant::now();

        let rows = match &mut self.target {
            Target::Pool(pool) => query.fetch_all(*pool).await?,
            Target::Transaction(connection) => query.fetch_all(&mut **connection).await?,
        };

        record_duration(&sql, started.elapsed(), self.slow_query_threshold);

        Ok(rows)
    }

    pub async fn fetch_one<'q>(
        &mut self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> WarehouseResult<PgRow> {
        let sql = query.sql().to_owned();
        let started = Instant::now();

        let row = match &mut self.target {
            Target::Pool(pool) => query.fetch_one(*pool).await?,
            Target::Transaction(connection) => query.fetch_one(&mut **connection).await?,
        };

        record_duration(&sql, started.elapsed(), self.slow_query_threshold);

        Ok(row)
    }

    /// Executes `sql`, first logging its `EXPLAIN` output when `explain` is set.
    ///
    /// The plan is obtained on the same target so it reflects the transaction's view.
    pub async fn execute_with_plan(&mut self, sql: &str, explain: bool) -> WarehouseResult<u64> {
        if explain {
            let explain_sql = format!("EXPLAIN {sql}");
            let plan: Vec<String> = match &mut self.target {
                Target::Pool(pool) => {
                    sqlx::query_scalar(&explain_sql)
                        .persistent(false)
                        .fetch_all(*pool)
                        .await?
                }
                Target::Transaction(connection) => {
                    sqlx::query_scalar(&explain_sql)
                        .persistent(false)
                        .fetch_all(&mut **connection)
                        .await?
                }
            };

            info!(statement = sql, plan = %plan.join("\n"), "execution plan");
        }

        self.execute(sql).await
    }
}

/// Logs `sql` at warn when `elapsed` reaches `slow_query_threshold`, at debug otherwise.
fn record_duration(sql: &str, elapsed: Duration, slow_query_threshold: Duration) {
    if elapsed >= slow_query_threshold {
        warn!(
            statement = sql,
            elapsed_ms = elapsed.as_millis() as u64,
            threshold_ms = slow_query_threshold.as_millis() as u64,
            "slow query"
        );
    } else {
        debug!(
            statement = sql,
            elapsed_ms = elapsed.as_millis() as u64,
            "statement executed"
        );
    }
}
