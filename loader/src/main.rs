//! Warehouse loader binary.
//!
//! Loads the gzip load files of one upload into a Postgres warehouse namespace, merging each
//! table with its destination table and deriving `users` from `identifies`.

use ::config::shared::LoaderServiceConfig;
use telemetry::metrics::init_metrics;
use telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_loader_config;
use crate::core::start_loader_with_config;
use crate::error::{LoaderError, LoaderResult};

mod config;
mod core;
mod error;

fn main() -> LoaderResult<()> {
    let loader_config = load_loader_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME")).map_err(LoaderError::config)?;

    init_metrics(
        Some(loader_config.warehouse.workspace_id.as_str()),
        Some(loader_config.warehouse.destination_id.as_str()),
    )
    .map_err(LoaderError::config)?;

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(loader_config));

    if let Err(err) = &result {
        eprint!("{}", err.render_report());
    }

    result
}

async fn async_main(loader_config: LoaderServiceConfig) -> LoaderResult<()> {
    if let Err(err) = start_loader_with_config(loader_config).await {
        error!("{err}");
        return Err(err);
    }

    Ok(())
}
