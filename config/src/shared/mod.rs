//! Configuration types shared by the warehouse engine and the loader binary.

mod base;
mod connection;
mod loader;
mod service;
mod warehouse;

pub use base::ValidationError;
pub use connection::{IntoConnectOptions, PgConnectionConfig, TlsConfig};
pub use loader::{DedupKey, LoaderConfig};
pub use service::LoaderServiceConfig;
pub use warehouse::WarehouseConfig;
