//! Main entry point for a Strand replication node.
//!
//! Loads the configuration, sets up logging and metrics, then runs the node
//! until it receives Ctrl+C or SIGTERM.

use std::sync::Arc;

use clap::Parser;
use strand_core::{LoggingApplier, exit_on_fatal};
use strand_server::model::{self, Cli};
use strand_server::startup;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = model::load_configuration(&cli)?;

    let _logging_guard = startup::init_logging(&model::logging_config(&configuration))?;

    strand_server::metrics::init_metrics();
    strand_server::metrics::install_exporter(&configuration)?;

    startup::run(
        configuration,
        cli.init,
        Arc::new(LoggingApplier),
        exit_on_fatal(),
    )
    .await
}
