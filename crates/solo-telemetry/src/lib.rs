//! Logging initialization for solod binaries and tests.

pub mod logging;
