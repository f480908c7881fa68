//! Text-format `COPY ... FROM STDIN` encoding.

use bytes::{BufMut, Bytes, BytesMut};
use pg_escape::quote_identifier;
use postgres::schema::quote_columns;

/// Buffered rows are sent to the server once the buffer reaches this size.
pub const COPY_FLUSH_THRESHOLD: usize = 64 * 1024;

const NULL_MARKER: &[u8] = b"\\N";

/// Builds the `COPY` statement streaming into `namespace.staging_table` in `columns` order.
pub fn copy_in_statement(namespace: &str, staging_table: &str, columns: &[&str]) -> String {
    format!(
        "COPY {}.{} ({}) FROM STDIN",
        quote_identifier(namespace),
        quote_identifier(staging_table),
        quote_columns(columns.iter().copied())
    )
}

/// Encodes rows in the Postgres text `COPY` format: tab separated fields, newline terminated
/// rows, `\N` for NULL.
#[derive(Debug, Default)]
pub struct CopyEncoder {
    buffer: BytesMut,
}

impl CopyEncoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(COPY_FLUSH_THRESHOLD),
        }
    }

    pub fn encode_row<S: AsRef<str>>(&mut self, row: &[Option<S>]) {
        for (index, field) in row.iter().enumerate() {
            if index > 0 {
                self.buffer.put_u8(b'\t');
            }
            match field {
                Some(value) => self.encode_value(value.as_ref()),
                None => self.buffer.put_slice(NULL_MARKER),
            }
        }
        self.buffer.put_u8(b'\n');
    }

    /// Whether enough data is buffered to be worth sending.
    pub fn should_flush(&self) -> bool {
        self.buffer.len() >= COPY_FLUSH_THRESHOLD
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Takes the buffered data, leaving the encoder empty.
    pub fn take(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    fn encode_value(&mut self, value: &str) {
        for byte in value.bytes() {
            match byte {
                b'\\' => self.buffer.put_slice(b"\\\\"),
                b'\t' => self.buffer.put_slice(b"\\t"),
                b'\n' => self.buffer.put_slice(b"\\n"),
                b'\r' => self.buffer.put_slice(b"\\r"),
                other => self.buffer.put_u8(other),
            }
        }
    }
}
