//! Structured logging setup for binaries and simulations

mod config;

pub use config::{init_tracing, LogFormat, LoggingConfig};
