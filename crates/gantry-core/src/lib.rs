//! Gantry core - shared configuration and error types
//!
//! Everything the daemon, engine, and control plane agree on lives here:
//! the executor configuration and the configuration error hierarchy.

pub mod config;
pub mod error;

pub use config::ExecutorConfig;
pub use error::{ConfigError, Result};
