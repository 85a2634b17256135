//! Data models module
//!
//! - `config` - Command line and configuration file loading

pub mod config;

pub use self::config::{Cli, load as load_configuration, logging_config};
