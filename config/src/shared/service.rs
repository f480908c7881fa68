use std::path::PathBuf;

use serde::Deserialize;

use crate::Config;
use crate::shared::{LoaderConfig, ValidationError, WarehouseConfig};

/// Complete configuration of the loader service.
///
/// Does not implement [`serde::Serialize`] since it carries the warehouse password.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoaderServiceConfig {
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    /// Directory holding `schema.json` and one sub-directory of gzip load files per table.
    pub load_files_dir: PathBuf,
    /// Tables to load, in order. `identifies` triggers the identity merge of `users`.
    pub tables: Vec<String>,
}

impl Config for LoaderServiceConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[
        "tables",
        "loader.skip_computing_user_latest_traits_workspace_ids",
        "loader.enable_sql_statement_execution_plan_workspace_ids",
    ];

    fn validate(&self) -> Result<(), ValidationError> {
        self.warehouse.validate()?;
        self.loader.validate()
    }
}
