//! Configuration management for Hop
//!
//! Handles CLI argument parsing, config file loading, and defaults.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "hop")]
#[command(about = "Content exchange node with push replication", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the Hop node
    Start(StartCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct StartCommand {
    /// Data directory for blocks, metadata and keys
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// TCP port for P2P transport
    #[arg(long, default_value_t = 8070)]
    pub listen_port: u16,

    /// HTTP port for REST API
    #[arg(long, default_value_t = 8080)]
    pub api_port: u16,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Bootstrap node multiaddr (can be specified multiple times)
    #[arg(long)]
    pub bootstrap_node: Vec<String>,

    /// Largest announced block this node agrees to replicate, in bytes
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    pub max_block_size: u64,

    /// Upper bound on a single block transfer, in seconds
    #[arg(long, default_value_t = 30)]
    pub transfer_timeout_secs: u64,

    /// TOML config file; command line flags are ignored when given
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub listen_port: u16,
    pub api_port: u16,
    pub log_level: String,
    pub bootstrap_nodes: Vec<String>,
    pub max_block_size: u64,
    pub transfer_timeout_secs: u64,
}

impl Config {
    /// Create config from CLI arguments
    pub fn from_cli() -> Result<Self, ConfigError> {
        let cli = Cli::parse();

        match cli.command {
            Commands::Start(cmd) => match &cmd.config {
                Some(path) => Self::load_from_file(path),
                None => {
                    let config: Config = cmd.into();
                    config.validate()?;
                    Ok(config)
                }
            },
        }
    }

    /// Load config from a TOML file; missing keys take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "transfer_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_block_size == 0 {
            return Err(ConfigError::Invalid(
                "max_block_size must be positive".to_string(),
            ));
        }
        if self.listen_port != 0 && self.listen_port == self.api_port {
            return Err(ConfigError::Invalid(format!(
                "listen_port and api_port are both {}",
                self.listen_port
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            listen_port: 8070,
            api_port: 8080,
            log_level: "info".to_string(),
            bootstrap_nodes: Vec::new(),
            max_block_size: 4 * 1024 * 1024,
            transfer_timeout_secs: 30,
        }
    }
}

impl From<StartCommand> for Config {
    fn from(cmd: StartCommand) -> Self {
        Config {
            data_dir: cmd.data_dir,
            listen_port: cmd.listen_port,
            api_port: cmd.api_port,
            log_level: cmd.log_level,
            bootstrap_nodes: cmd.bootstrap_node,
            max_block_size: cmd.max_block_size,
            transfer_timeout_secs: cmd.transfer_timeout_secs,
        }
    }
}
