//! Configuration management for LISHnet
//!
//! Handles CLI argument parsing, config file loading, and defaults.
//! Values given on the command line override the config file.

use clap::{Args, Parser, Subcommand};
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::chunker::DEFAULT_CHUNK_SIZE;
use crate::p2p::SwarmSettings;
use crate::transfer::TransferSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Cli(#[from] clap::Error),
}

#[derive(Parser, Debug)]
#[command(name = "lishnet")]
#[command(about = "Chunked dataset distribution over private libp2p networks", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a node with its control API
    Start(StartCommand),
    /// Build a manifest for a file or directory
    MakeLish(MakeLishCommand),
    /// Generate a network definition with a fresh pre-shared key
    MakeNet(MakeNetCommand),
}

#[derive(Args, Debug, Clone, Default)]
pub struct StartCommand {
    /// TOML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Data directory for the node key, chunk store and network configs
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Multiaddr every enabled network listens on
    #[arg(long)]
    pub listen_address: Option<String>,

    /// HTTP port for the control API
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Where downloaded datasets are written
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Hashing threads, 0 for available parallelism
    #[arg(long)]
    pub hash_workers: Option<usize>,

    /// Attempts per chunk after the first one fails
    #[arg(long)]
    pub chunk_retries: Option<u32>,

    /// Chunks fetched concurrently per download
    #[arg(long)]
    pub max_parallel_chunks: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct MakeLishCommand {
    /// File or directory to describe
    pub input: PathBuf,

    /// Output manifest path (default: <input name>.lish)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Dataset id (default: random UUID)
    #[arg(long)]
    pub id: Option<String>,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// Chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Checksum algorithm (sha256, sha384, sha512, sha512-256, sha3-256, sha3-384, sha3-512, blake3)
    #[arg(long, default_value = "sha256")]
    pub algorithm: String,

    /// Hashing threads, 0 for available parallelism
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Write compact JSON
    #[arg(long)]
    pub minify: bool,

    /// Compress the manifest with zstd
    #[arg(long)]
    pub compress: bool,
}

#[derive(Args, Debug, Clone)]
pub struct MakeNetCommand {
    /// Network name
    pub name: String,

    #[arg(long)]
    pub description: Option<String>,

    /// Bootstrap peer multiaddr (can be specified multiple times)
    #[arg(long = "bootstrap")]
    pub bootstrap: Vec<String>,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub listen_address: String,
    pub api_port: u16,
    pub log_level: String,
    /// Defaults to `<data_dir>/downloads`
    pub download_dir: Option<PathBuf>,
    pub hash_workers: usize,
    pub chunk_retries: u32,
    pub max_parallel_chunks: usize,
    pub request_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub peer_discovery_attempts: u32,
    pub peer_retry_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            listen_address: "/ip4/0.0.0.0/tcp/0".to_string(),
            api_port: 8080,
            log_level: "info".to_string(),
            download_dir: None,
            hash_workers: 0,
            chunk_retries: 3,
            max_parallel_chunks: 8,
            request_timeout_secs: 30,
            dial_timeout_secs: 15,
            idle_timeout_secs: 300,
            peer_discovery_attempts: 10,
            peer_retry_interval_ms: 1000,
        }
    }
}

/// What the binary was asked to do
#[derive(Debug)]
pub enum Command {
    Start(Config),
    MakeLish(MakeLishCommand),
    MakeNet(MakeNetCommand),
}

impl Command {
    pub fn from_cli() -> Result<Self, ConfigError> {
        Self::from_parsed(Cli::parse())
    }

    pub fn try_from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::from_parsed(Cli::try_parse_from(args)?)
    }

    fn from_parsed(cli: Cli) -> Result<Self, ConfigError> {
        Ok(match cli.command {
            Commands::Start(cmd) => Command::Start(Config::from_start(&cmd)?),
            Commands::MakeLish(cmd) => Command::MakeLish(cmd),
            Commands::MakeNet(cmd) => Command::MakeNet(cmd),
        })
    }

    pub fn log_level(&self) -> &str {
        match self {
            Command::Start(config) => &config.log_level,
            _ => "info",
        }
    }
}

impl Config {
    /// Load config from TOML file; missing keys take defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// File (if any) first, then CLI overrides
    pub fn from_start(cmd: &StartCommand) -> Result<Self, ConfigError> {
        let mut config = match &cmd.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply(cmd);
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, cmd: &StartCommand) {
        if let Some(v) = &cmd.data_dir {
            self.data_dir = v.clone();
        }
        if let Some(v) = &cmd.listen_address {
            self.listen_address = v.clone();
        }
        if let Some(v) = cmd.api_port {
            self.api_port = v;
        }
        if let Some(v) = &cmd.log_level {
            self.log_level = v.clone();
        }
        if let Some(v) = &cmd.download_dir {
            self.download_dir = Some(v.clone());
        }
        if let Some(v) = cmd.hash_workers {
            self.hash_workers = v;
        }
        if let Some(v) = cmd.chunk_retries {
            self.chunk_retries = v;
        }
        if let Some(v) = cmd.max_parallel_chunks {
            self.max_parallel_chunks = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_multiaddr()?;
        if self.max_parallel_chunks == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_chunks must be at least 1".to_string(),
            ));
        }
        if self.dial_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn listen_multiaddr(&self) -> Result<Multiaddr, ConfigError> {
        self.listen_address.parse().map_err(|e| {
            ConfigError::Invalid(format!("listen_address {}: {}", self.listen_address, e))
        })
    }

    pub fn node_key_path(&self) -> PathBuf {
        self.data_dir.join("node.key")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("chunks")
    }

    pub fn networks_path(&self) -> PathBuf {
        self.data_dir.join("networks.json")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("downloads"))
    }

    pub fn swarm_settings(&self) -> SwarmSettings {
        SwarmSettings {
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            download_dir: self.download_dir(),
            chunk_retries: self.chunk_retries,
            max_parallel_chunks: self.max_parallel_chunks,
            peer_discovery_attempts: self.peer_discovery_attempts,
            peer_retry_interval: Duration::from_millis(self.peer_retry_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.download_dir(), PathBuf::from("./data/downloads"));
        assert_eq!(config.swarm_settings().dial_timeout, Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lishnet.toml");
        std::fs::write(
            &path,
            "data_dir = \"/srv/lish\"\napi_port = 9000\nchunk_retries = 7\n",
        )
        .unwrap();

        let cmd = StartCommand {
            config: Some(path),
            api_port: Some(9100),
            log_level: Some("debug".to_string()),
            ..StartCommand::default()
        };
        let config = Config::from_start(&cmd).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/lish"));
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.chunk_retries, 7);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_parallel_chunks, 8);
        assert_eq!(config.download_dir(), PathBuf::from("/srv/lish/downloads"));
    }

    #[test]
    fn test_invalid_listen_address() {
        let cmd = StartCommand {
            listen_address: Some("nonsense".to_string()),
            ..StartCommand::default()
        };
        assert!(matches!(
            Config::from_start(&cmd),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_subcommands() {
        let cmd = Command::try_from_args([
            "lishnet",
            "make-lish",
            "/tmp/data",
            "--chunk-size",
            "4096",
            "--algorithm",
            "blake3",
            "--compress",
        ])
        .unwrap();
        match cmd {
            Command::MakeLish(cmd) => {
                assert_eq!(cmd.chunk_size, 4096);
                assert_eq!(cmd.algorithm, "blake3");
                assert!(cmd.compress);
                assert!(!cmd.minify);
            }
            other => panic!("unexpected {:?}", other),
        }

        let cmd = Command::try_from_args([
            "lishnet",
            "make-net",
            "lab",
            "--bootstrap",
            "/ip4/10.0.0.1/tcp/4001",
        ])
        .unwrap();
        assert!(matches!(cmd, Command::MakeNet(ref c) if c.bootstrap.len() == 1));

        let cmd = Command::try_from_args(["lishnet", "start", "--api-port", "9001"]).unwrap();
        assert!(matches!(cmd, Command::Start(ref c) if c.api_port == 9001));
        assert_eq!(cmd.log_level(), "info");
    }
}
