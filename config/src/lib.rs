//! Configuration for the warehouse loader.
//!
//! Holds the serde types shared by the engine and the loader binary, and the hierarchical
//! loader that reads them from `configuration/` files and `APP_` environment variables.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
