//! Where load files and table schemas come from.
//!
//! Load files are materialized into local paths owned by a [`LocalLoadFiles`] guard, which
//! deletes them when dropped so local copies never outlive a load attempt.

use std::future::Future;
use std::fs;
use std::path::{Path, PathBuf};

use postgres::types::{Schema, TableSchema};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, WarehouseResult};
use crate::warehouse_error;

/// File name of the upload schema inside a [`LocalDirectorySource`] root.
pub const UPLOAD_SCHEMA_FILE: &str = "schema.json";

/// Extension of load files picked up by [`LocalDirectorySource`].
pub const LOAD_FILE_EXTENSION: &str = "gz";

/// Provides per-table schemas and load files to the warehouse.
pub trait LoadFileSource {
    /// Columns of `table` in the current upload. Empty when the upload has no such table.
    fn table_schema_in_upload(&self, table: &str) -> TableSchema;

    /// Columns of `table` as they exist in the warehouse.
    fn table_schema_in_warehouse(&self, table: &str) -> TableSchema;

    /// Materializes every load file of `table` locally.
    fn download_load_files(
        &self,
        table: &str,
    ) -> impl Future<Output = WarehouseResult<LocalLoadFiles>> + Send;
}

/// Local copies of load files, deleted on drop.
#[derive(Debug, Default)]
pub struct LocalLoadFiles {
    paths: Vec<PathBuf>,
    directory: Option<PathBuf>,
}

impl LocalLoadFiles {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            directory: None,
        }
    }

    /// Files living in a scratch `directory` that is removed together with them.
    pub fn in_directory(paths: Vec<PathBuf>, directory: PathBuf) -> Self {
        Self {
            paths,
            directory: Some(directory),
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Drop for LocalLoadFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(err) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %err, "failed to remove local load file");
            }
        }
        if let Some(directory) = &self.directory {
            if let Err(err) = fs::remove_dir_all(directory) {
                warn!(path = %directory.display(), error = %err, "failed to remove load file directory");
            }
        }
    }
}

/// Reads uploads from a directory laid out as `<root>/schema.json` plus
/// `<root>/<table>/*.gz`.
///
/// Load files are copied into a fresh scratch directory per download so that deleting the
/// local copies leaves the source directory untouched.
#[derive(Debug, Clone)]
pub struct LocalDirectorySource {
    root: PathBuf,
    upload_schema: Schema,
    warehouse_schema: Schema,
}

impl LocalDirectorySource {
    /// Opens `root`, reading the upload schema from [`UPLOAD_SCHEMA_FILE`].
    pub fn open(root: impl Into<PathBuf>) -> WarehouseResult<Self> {
        let root = root.into();
        let schema_path = root.join(UPLOAD_SCHEMA_FILE);
        let file = fs::File::open(&schema_path).map_err(|err| {
            warehouse_error!(
                ErrorKind::ConfigError,
                "Upload schema is missing",
                format!("could not open `{}`: {err}", schema_path.display()),
                source: err
            )
        })?;
        let upload_schema: Schema = serde_json::from_reader(std::io::BufReader::new(file))?;

        Ok(Self::new(root, upload_schema))
    }

    pub fn new(root: impl Into<PathBuf>, upload_schema: Schema) -> Self {
        Self {
            root: root.into(),
            upload_schema,
            warehouse_schema: Schema::new(),
        }
    }

    pub fn upload_schema(&self) -> &Schema {
        &self.upload_schema
    }

    /// Replaces the warehouse-side schema, typically with the result of a schema fetch.
    pub fn set_warehouse_schema(&mut self, schema: Schema) {
        self.warehouse_schema = schema;
    }

    fn copy_load_files(root: &Path, table: &str) -> WarehouseResult<LocalLoadFiles> {
        let table_dir = root.join(table);
        let mut sources = Vec::new();
        if table_dir.is_dir() {
            for entry in fs::read_dir(&table_dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == LOAD_FILE_EXTENSION) {
                    sources.push(path);
                }
            }
        }
        sources.sort();

        let scratch = std::env::temp_dir()
            .join("wh_load_files")
            .join(format!("{table}_{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&scratch)?;

        // Tracked before copying so partial copies are cleaned up on failure.
        let mut files =
            LocalLoadFiles::in_directory(Vec::with_capacity(sources.len()), scratch.clone());
        for (index, source) in sources.iter().enumerate() {
            let target = scratch.join(format!("{index:05}.csv.gz"));
            fs::copy(source, &target)?;
            files.paths.push(target);
        }

        debug!(table, files = files.len(), "load files materialized");

        Ok(files)
    }
}

impl LoadFileSource for LocalDirectorySource {
    fn table_schema_in_upload(&self, table: &str) -> TableSchema {
        self.upload_schema.get(table).cloned().unwrap_or_default()
    }

    fn table_schema_in_warehouse(&self, table: &str) -> TableSchema {
        self.warehouse_schema.get(table).cloned().unwrap_or_default()
    }

    async fn download_load_files(&self, table: &str) -> WarehouseResult<LocalLoadFiles> {
        let root = self.root.clone();
        let table = table.to_string();

        tokio::task::spawn_blocking(move || Self::copy_load_files(&root, &table))
            .await
            .map_err(|err| {
                warehouse_error!(
                    ErrorKind::InvalidState,
                    "Load file download task failed",
                    err.to_string(),
                    source: err
                )
            })?
    }
}
