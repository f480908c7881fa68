use std::collections::BTreeMap;
use std::fmt;

use pg_escape::quote_identifier;
use serde::{Deserialize, Serialize};

/// Canonical column type shared by every destination dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int,
    Float,
    String,
    Datetime,
    Boolean,
    Json,
}

impl DataType {
    /// Native Postgres type used when creating columns of this type.
    pub fn to_postgres(self) -> &'static str {
        match self {
            DataType::Int => "bigint",
            DataType::Float => "numeric",
            DataType::String => "text",
            DataType::Datetime => "timestamptz",
            DataType::Boolean => "boolean",
            DataType::Json => "jsonb",
        }
    }

    /// Maps a native type, as reported by `information_schema.columns.data_type`, back to its
    /// canonical type.
    ///
    /// Returns `None` for types the loader does not know about; callers must surface those
    /// columns instead of dropping them.
    pub fn from_postgres(native: &str) -> Option<DataType> {
        let data_type = match native {
            "integer" | "smallint" | "bigint" => DataType::Int,
            "double precision" | "numeric" | "real" => DataType::Float,
            "text" | "varchar" | "char" | "character varying" | "character" => DataType::String,
            "timestamptz" | "timestamp with time zone" | "timestamp" => DataType::Datetime,
            "boolean" => DataType::Boolean,
            "jsonb" => DataType::Json,
            _ => return None,
        };

        Some(data_type)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::String => "string",
            DataType::Datetime => "datetime",
            DataType::Boolean => "boolean",
            DataType::Json => "json",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column name to canonical type.
///
/// Iteration is sorted by column name, which is also the column order of every load file.
pub type TableSchema = BTreeMap<String, DataType>;

/// Table name to [`TableSchema`].
pub type Schema = BTreeMap<String, TableSchema>;

/// Table name to column name to native type, for columns without a canonical mapping.
pub type UnrecognizedSchema = BTreeMap<String, BTreeMap<String, String>>;

/// Renders `"column" type` pairs for a `CREATE TABLE` column list.
pub fn columns_with_data_types(schema: &TableSchema) -> String {
    schema
        .iter()
        .map(|(name, data_type)| format!("{} {}", quote_identifier(name), data_type.to_postgres()))
        .collect::<Vec<_>>()
        .join(", ")
}
