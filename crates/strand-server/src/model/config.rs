//! Configuration loading for the node binary
//!
//! Sources, lowest precedence first: the YAML file (`conf/strand.yml` by
//! default), `STRAND__*` environment variables (`STRAND__NODE__ID=3` sets
//! `strand.node.id`), then command line flags.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use config::{Config, Environment};

use strand_common::NodeId;
use strand_core::Configuration;

use crate::startup::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/strand.yml";

/// Command line arguments for the node
#[derive(Debug, Default, Parser)]
#[command(name = "strand-server", version, about = "Replicated change log node")]
pub struct Cli {
    /// Configuration file; defaults to conf/strand.yml when present
    #[arg(short = 'c', long = "config", env = "STRAND_CONFIG")]
    pub config: Option<PathBuf>,
    /// Overrides strand.node.id
    #[arg(short = 'n', long = "node-id")]
    pub node_id: Option<NodeId>,
    /// Overrides strand.node.port
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
    /// Create a fresh node state file when none exists
    #[arg(long = "init")]
    pub init: bool,
}

/// Build the configuration from the file, environment and `cli`
pub fn load(cli: &Cli) -> anyhow::Result<Configuration> {
    let (file, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    let mut builder = Config::builder()
        .add_source(config::File::from(file.as_path()).required(required))
        .add_source(
            Environment::with_prefix("STRAND")
                .prefix_separator("__")
                .separator("__")
                .keep_prefix(true)
                .try_parsing(true),
        );

    if let Some(node_id) = cli.node_id {
        builder = builder.set_override("strand.node.id", node_id as i64)?;
    }
    if let Some(port) = cli.port {
        builder = builder.set_override("strand.node.port", port as i64)?;
    }

    let config = builder
        .build()
        .with_context(|| format!("failed to load configuration from {}", file.display()))?;
    Ok(Configuration::from_config(config))
}

/// Logging settings under `strand.logs`
pub fn logging_config(configuration: &Configuration) -> LoggingConfig {
    let config = &configuration.config;
    LoggingConfig::from_config(
        config.get_string("strand.logs.path").ok(),
        config.get_bool("strand.logs.console").unwrap_or(true),
        config.get_bool("strand.logs.file").unwrap_or(true),
        config
            .get_string("strand.logs.level")
            .unwrap_or_else(|_| "info".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from(["strand-server", "--node-id", "4", "-p", "9400", "--init"]);
        assert_eq!(cli.node_id, Some(4));
        assert_eq!(cli.port, Some(9400));
        assert!(cli.init);
        assert!(cli.config.is_none() || std::env::var("STRAND_CONFIG").is_ok());
    }

    #[test]
    fn test_load_file_with_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "strand:\n  node:\n    id: 1\n    port: 9301\n  cluster:\n    nodes:\n      - 2@10.0.0.2:9302\n  logs:\n    level: debug\n    console: false"
        )
        .unwrap();

        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            node_id: Some(7),
            ..Default::default()
        };
        let configuration = load(&cli).unwrap();
        assert_eq!(configuration.node_id(), 7);
        assert_eq!(configuration.node_port(), 9301);
        assert_eq!(
            configuration.cluster_nodes(),
            vec![(2, "10.0.0.2".to_string(), 9302)]
        );

        let logging = logging_config(&configuration);
        assert!(!logging.console_output);
        assert_eq!(logging.console_level, tracing::Level::DEBUG);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/strand.yml")),
            ..Default::default()
        };
        assert!(load(&cli).is_err());
    }
}
