//! Command-line interface

use clap::{Parser, ValueEnum};
use gantry_core::{ConfigError, ExecutorConfig};
use std::path::PathBuf;

/// Node-level container executor daemon
#[derive(Debug, Parser)]
#[command(name = "gantryd", version, about)]
pub struct Cli {
    /// Path to a JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address the control plane listens on (host:port)
    #[arg(long)]
    pub listen_address: Option<String>,

    /// Backend transport ("tcp" or "memory")
    #[arg(long)]
    pub backend_network: Option<String>,

    /// Backend dial string
    #[arg(long)]
    pub backend_address: Option<String>,

    /// Owner tag for containers created by this executor
    #[arg(long)]
    pub container_owner_name: Option<String>,

    /// Grace window between the drain signal and forced cancellation
    #[arg(long)]
    pub drain_timeout_secs: Option<u64>,

    /// Allow actions to run as root inside containers
    #[arg(long)]
    pub allow_privileged: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Cli {
    /// Load the file config (or defaults) and apply flag overrides
    pub fn merged_config(&self) -> Result<ExecutorConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => ExecutorConfig::from_file(path)?,
            None => ExecutorConfig::default(),
        };

        if let Some(listen_address) = &self.listen_address {
            config.listen_address = listen_address.clone();
        }
        if let Some(backend_network) = &self.backend_network {
            config.backend_network = backend_network.clone();
        }
        if let Some(backend_address) = &self.backend_address {
            config.backend_address = backend_address.clone();
        }
        if let Some(owner) = &self.container_owner_name {
            config.container_owner_name = owner.clone();
        }
        if let Some(drain_timeout_secs) = self.drain_timeout_secs {
            config.drain_timeout_secs = drain_timeout_secs;
        }
        if self.allow_privileged {
            config.allow_privileged = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "gantryd",
            "--listen-address",
            "127.0.0.1:1700",
            "--container-owner-name",
            "node-7",
            "--drain-timeout-secs",
            "30",
            "--allow-privileged",
        ]);
        let config = cli.merged_config().unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:1700");
        assert_eq!(config.container_owner_name, "node-7");
        assert_eq!(config.drain_timeout_secs, 30);
        assert!(config.allow_privileged);
    }

    #[test]
    fn invalid_overrides_fail_validation() {
        let cli = Cli::parse_from(["gantryd", "--backend-network", "tcp"]);
        assert!(cli.merged_config().is_err());
    }
}
