//! Tracing and metrics bootstrap shared by the loader binary and the test suites.

pub mod metrics;
pub mod tracing;
