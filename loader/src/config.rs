use config::load_config;
use config::shared::LoaderServiceConfig;

use crate::error::{LoaderError, LoaderResult};

/// Loads and validates the loader configuration.
pub fn load_loader_config() -> LoaderResult<LoaderServiceConfig> {
    load_config::<LoaderServiceConfig>().map_err(LoaderError::config)
}
