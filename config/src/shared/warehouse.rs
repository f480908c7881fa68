use serde::Deserialize;

use crate::shared::{PgConnectionConfig, ValidationError};

/// Identity and connection of one destination warehouse.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WarehouseConfig {
    pub workspace_id: String,
    pub destination_id: String,
    /// Schema in which destination and staging tables live.
    pub namespace: String,
    pub connection: PgConnectionConfig,
}

impl WarehouseConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.namespace.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "warehouse.namespace".to_string(),
                constraint: "cannot be empty".to_string(),
            });
        }

        self.connection.validate()
    }
}
