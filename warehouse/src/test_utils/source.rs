use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use postgres::types::{Schema, TableSchema};
use uuid::Uuid;

use crate::error::WarehouseResult;
use crate::source::{LoadFileSource, LocalLoadFiles};

/// [`LoadFileSource`] serving gzip CSV load files kept in memory.
///
/// Every download writes fresh copies into a scratch directory, like a real download would.
#[derive(Debug, Default, Clone)]
pub struct MemoryLoadFileSource {
    upload_schema: Schema,
    warehouse_schema: Schema,
    load_files: BTreeMap<String, Vec<Vec<u8>>>,
}

impl MemoryLoadFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `table` with the same schema in the upload and in the warehouse.
    pub fn with_table(mut self, table: &str, schema: TableSchema) -> Self {
        self.upload_schema.insert(table.to_string(), schema.clone());
        self.warehouse_schema.insert(table.to_string(), schema);
        self
    }

    pub fn set_upload_schema(&mut self, table: &str, schema: TableSchema) {
        self.upload_schema.insert(table.to_string(), schema);
    }

    pub fn set_warehouse_schema(&mut self, table: &str, schema: TableSchema) {
        self.warehouse_schema.insert(table.to_string(), schema);
    }

    /// Adds one load file of `table` holding `rows`, fields in sorted column order.
    ///
    /// Empty fields are written as empty CSV fields.
    pub fn add_load_file(&mut self, table: &str, rows: &[&[&str]]) {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(Vec::new());
        for row in rows {
            writer.write_record(*row).expect("Failed to write csv row");
        }
        let csv = writer.into_inner().expect("Failed to flush csv writer");

        self.add_raw_load_file(table, &csv);
    }

    /// Adds one load file of `table` with `contents` gzip-compressed as is.
    pub fn add_raw_load_file(&mut self, table: &str, contents: &[u8]) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(contents)
            .expect("Failed to compress load file");
        let compressed = encoder.finish().expect("Failed to finish gzip stream");

        self.load_files
            .entry(table.to_string())
            .or_default()
            .push(compressed);
    }

    /// Adds one load file of `table` whose contents are not valid gzip.
    pub fn add_corrupt_load_file(&mut self, table: &str, contents: &[u8]) {
        self.load_files
            .entry(table.to_string())
            .or_default()
            .push(contents.to_vec());
    }
}

impl LoadFileSource for MemoryLoadFileSource {
    fn table_schema_in_upload(&self, table: &str) -> TableSchema {
        self.upload_schema.get(table).cloned().unwrap_or_default()
    }

    fn table_schema_in_warehouse(&self, table: &str) -> TableSchema {
        self.warehouse_schema.get(table).cloned().unwrap_or_default()
    }

    async fn download_load_files(&self, table: &str) -> WarehouseResult<LocalLoadFiles> {
        let directory = std::env::temp_dir()
            .join("wh_test_load_files")
            .join(format!("{table}_{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&directory)?;

        let mut paths = Vec::new();
        for (index, contents) in self.load_files.get(table).into_iter().flatten().enumerate() {
            let path = directory.join(format!("{index:05}.csv.gz"));
            fs::write(&path, contents)?;
            paths.push(path);
        }

        Ok(LocalLoadFiles::in_directory(paths, directory))
    }
}
