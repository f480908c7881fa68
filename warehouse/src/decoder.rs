//! Lazy decoding of gzip compressed, header-less CSV load files.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use csv::StringRecord;
use flate2::read::GzDecoder;

use crate::error::{ErrorKind, LoadStage, WarehouseError, WarehouseResult};
use crate::warehouse_error;

/// Decoded row, one entry per column. Blank fields decode to `None`.
pub type Row = Vec<Option<String>>;

/// Single-pass iterator over the rows of one load file.
///
/// Each row must have exactly `expected_columns` fields. The first error ends the iteration.
pub struct RowDecoder<R> {
    reader: csv::Reader<R>,
    record: StringRecord,
    expected_columns: usize,
    table: String,
    rows_processed: u64,
    finished: bool,
}

impl RowDecoder<GzDecoder<BufReader<File>>> {
    /// Opens a gzip compressed load file.
    ///
    /// Decompression is lazy, so a corrupt gzip header surfaces on the first row.
    pub fn open_gzip(path: &Path, expected_columns: usize, table: &str) -> WarehouseResult<Self> {
        let file = File::open(path).map_err(|err| {
            warehouse_error!(
                ErrorKind::IoError,
                "Failed to open load file",
                format!("could not open `{}`: {err}", path.display()),
                source: err
            )
            .with_stage(LoadStage::LoadFilesOpening)
        })?;

        Ok(Self::new(
            GzDecoder::new(BufReader::new(file)),
            expected_columns,
            table,
        ))
    }
}

impl<R: Read> RowDecoder<R> {
    pub fn new(reader: R, expected_columns: usize, table: &str) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        Self {
            reader,
            record: StringRecord::new(),
            expected_columns,
            table: table.to_string(),
            rows_processed: 0,
            finished: false,
        }
    }

    /// Rows successfully decoded so far.
    pub fn rows_processed(&self) -> u64 {
        self.rows_processed
    }

    fn read_row(&mut self) -> WarehouseResult<Option<Row>> {
        let has_record = self.reader.read_record(&mut self.record).map_err(|err| {
            let stage = match err.kind() {
                csv::ErrorKind::Io(_) => LoadStage::LoadFilesGzipReading,
                _ => LoadStage::LoadFilesCsvReading,
            };
            WarehouseError::from(err).with_stage(stage)
        })?;
        if !has_record {
            return Ok(None);
        }

        if self.record.len() != self.expected_columns {
            return Err(warehouse_error!(
                ErrorKind::ColumnCountMismatch,
                "Load file row does not match the upload schema",
                format!(
                    "columns in csv row: {}, columns in upload schema of table {}: {}, rows processed in csv file until mismatch: {}",
                    self.record.len(),
                    self.table,
                    self.expected_columns,
                    self.rows_processed
                )
            )
            .with_stage(LoadStage::CsvColumnCountMismatch));
        }

        let row = self
            .record
            .iter()
            .map(|field| {
                if field.trim().is_empty() {
                    None
                } else {
                    Some(field.to_string())
                }
            })
            .collect();
        self.rows_processed += 1;

        Ok(Some(row))
    }
}

impl<R: Read> Iterator for RowDecoder<R> {
    type Item = WarehouseResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
