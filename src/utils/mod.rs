//! Shared utilities: the service-level error type and logging setup.

pub mod error;
pub mod logging;
