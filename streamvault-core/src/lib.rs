//! Shared foundation for the StreamVault media server.
//!
//! Holds the configuration model (server settings plus per-path
//! configurations), the error taxonomy used across all crates, and the
//! logging bootstrap.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, LoggingConfig, PathConf, PathConfSet, ServerConfig};
pub use error::{Error, Result};
