use std::io;
use std::sync::Once;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Enables log output in tests when set to any value.
const ENABLE_TRACING_ENV_NAME: &str = "ENABLE_TRACING";

/// Switches the log output to JSON lines when set to `json`.
const LOG_FORMAT_ENV_NAME: &str = "LOG_FORMAT";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to parse the log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install the log bridge: {0}")]
    LogBridge(#[from] tracing_log::log::SetLoggerError),

    #[error("failed to install the global subscriber: {0}")]
    Init(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Flushes buffered log lines when dropped.
///
/// Must be held until the process exits, otherwise trailing log lines are lost.
#[must_use]
pub struct LogFlusher {
    _guard: WorkerGuard,
}

/// Installs the global subscriber writing to stdout through a non-blocking writer.
///
/// The filter honors `RUST_LOG` and falls back to [`DEFAULT_FILTER`]. Setting `LOG_FORMAT=json`
/// emits JSON lines instead of the human readable format.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)?,
    };

    tracing_log::LogTracer::init()?;

    let (writer, guard) = tracing_appender::non_blocking(io::stdout());
    let json = std::env::var(LOG_FORMAT_ENV_NAME).is_ok_and(|format| format == "json");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true).with_writer(writer)),
        )?;
    } else {
        tracing::subscriber::set_global_default(
            registry.with(fmt::layer().with_target(true).with_writer(writer)),
        )?;
    }

    tracing::info!(app = app_name, "tracing initialized");

    Ok(LogFlusher { _guard: guard })
}

static INIT_TEST_TRACING: Once = Once::new();

/// Installs a test writer subscriber once per process when `ENABLE_TRACING` is set.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var(ENABLE_TRACING_ENV_NAME).is_err() {
            return;
        }

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug,sqlx=warn"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
