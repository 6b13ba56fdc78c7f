//! Server configuration management.
//!
//! Configuration is merged from, lowest priority first:
//! 1. Default values
//! 2. TOML config file (relay-server.toml, created with defaults if missing)
//! 3. Environment variables (RELAY_*)
//! 4. Command-line arguments

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};
use tracing::info;

/// Default configuration file content with comments.
pub const DEFAULT_CONFIG_CONTENT: &str = r#"# Voice Relay Server Configuration
# ================================
#
# All options can be overridden via RELAY_* environment variables or
# command-line arguments.

# UDP port to listen on.
port = 10515

# Shared key clients must present during the transport handshake.
connection_key = "voice-relay"

# Logging level.
# Options: trace, debug, info, warn, error
log_level = "info"

# Milliseconds between poll cycles of the relay driver.
poll_interval_ms = 5

# Transport keepalive: ping peers after this much send silence (ms).
keepalive_ms = 1000

# Declare a peer dead after this much receive silence (ms).
disconnect_timeout_ms = 5000
"#;

/// Command-line arguments for the relay server.
#[derive(Parser, Debug, Default)]
#[command(name = "relay-server")]
#[command(about = "Voice relay server", long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file.
    /// If the file doesn't exist, it will be created with default values.
    #[arg(short, long, default_value = "relay-server.toml")]
    pub config: PathBuf,

    /// UDP port to listen on (overrides config file).
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Connection key clients must present (overrides config file).
    #[arg(short = 'k', long)]
    pub connection_key: Option<String>,

    /// Logging level (overrides config file).
    /// Options: trace, debug, info, warn, error
    #[arg(short, long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_connection_key")]
    pub connection_key: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,

    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
}

fn default_port() -> u16 {
    10515
}

fn default_connection_key() -> String {
    "voice-relay".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_keepalive_ms() -> u64 {
    1000
}

fn default_disconnect_timeout_ms() -> u64 {
    5000
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connection_key: default_connection_key(),
            log_level: default_log_level(),
            poll_interval_ms: default_poll_interval_ms(),
            keepalive_ms: default_keepalive_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
        }
    }
}

/// Resolved server configuration after merging all sources.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub connection_key: String,
    pub log_level: String,
    pub poll_interval: Duration,
    pub keepalive: Duration,
    pub disconnect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig::from_file_config(FileConfig::default())
    }
}

impl RelayConfig {
    /// Load configuration from CLI args, environment and config file.
    pub fn load() -> Result<Self> {
        Self::load_with_args(CliArgs::parse())
    }

    /// Load configuration with the given CLI args. Useful for testing.
    pub fn load_with_args(args: CliArgs) -> Result<Self> {
        // RELAY_NO_CONFIG skips the config file entirely (for testing).
        let file_config = if std::env::var("RELAY_NO_CONFIG").is_ok() {
            FileConfig::default()
        } else if args.config.exists() {
            let content = fs::read_to_string(&args.config)
                .with_context(|| format!("failed to read config file: {}", args.config.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", args.config.display()))?
        } else {
            info!(
                "config file not found, creating default: {}",
                args.config.display()
            );
            fs::write(&args.config, DEFAULT_CONFIG_CONTENT).with_context(|| {
                format!("failed to create config file: {}", args.config.display())
            })?;
            FileConfig::default()
        };

        let env_port = std::env::var("RELAY_PORT")
            .ok()
            .and_then(|p| p.parse().ok());
        let env_key = std::env::var("RELAY_CONNECTION_KEY").ok();
        let env_log_level = std::env::var("RELAY_LOG_LEVEL").ok();

        let mut resolved = Self::from_file_config(file_config);
        if let Some(port) = args.port.or(env_port) {
            resolved.port = port;
        }
        if let Some(key) = args.connection_key.or(env_key) {
            resolved.connection_key = key;
        }
        if let Some(level) = args.log_level.or(env_log_level) {
            resolved.log_level = level;
        }
        Ok(resolved)
    }

    fn from_file_config(file: FileConfig) -> Self {
        RelayConfig {
            port: file.port,
            connection_key: file.connection_key,
            log_level: file.log_level,
            poll_interval: Duration::from_millis(file.poll_interval_ms),
            keepalive: Duration::from_millis(file.keepalive_ms),
            disconnect_timeout: Duration::from_millis(file.disconnect_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 10515);
        assert_eq!(config.connection_key, "voice-relay");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.poll_interval, Duration::from_millis(5));
    }

    #[test]
    fn default_file_content_parses_to_defaults() {
        let parsed: FileConfig = toml::from_str(DEFAULT_CONFIG_CONTENT).unwrap();
        let defaults = FileConfig::default();
        assert_eq!(parsed.port, defaults.port);
        assert_eq!(parsed.connection_key, defaults.connection_key);
        assert_eq!(parsed.disconnect_timeout_ms, defaults.disconnect_timeout_ms);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let parsed: FileConfig = toml::from_str("port = 7000").unwrap();
        assert_eq!(parsed.port, 7000);
        assert_eq!(parsed.log_level, "info");
        assert_eq!(parsed.keepalive_ms, 1000);
    }
}
