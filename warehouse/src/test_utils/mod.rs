//! Helpers for exercising the warehouse against a local Postgres.
//!
//! [`database`] spawns an isolated database per test and [`source`] provides load files
//! written on the fly.

pub mod database;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod source;
