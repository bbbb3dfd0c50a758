//! Logging initialisation for txretry
//!
//! Library crates only emit events through `log` and `tracing`; binaries and
//! test harnesses call one of the initialisers here once at startup.

pub mod init;

pub use init::{init_logging_from_config, init_simple_tracing};
