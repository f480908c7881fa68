//! Postgres dialect support for the warehouse loader.
//!
//! Owns the canonical ⇄ native type mapping, identifier quoting and connection pool setup.

pub mod pool;
pub mod schema;
#[cfg(feature = "test-utils")]
pub mod test_utils;
pub mod types;
