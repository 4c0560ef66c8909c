//! Section-per-concern configuration, loaded from an optional TOML file and
//! overridable by CLI flags, the way the source's `segcache` binary's `Config`
//! is organized.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 11211,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub autoreload: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig { autoreload: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub slowdown: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig { slowdown: 0.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    pub extra_stats: bool,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig { extra_stats: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn listen(&self) -> SocketAddr {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .expect("host/port did not form a valid socket address")
    }
}

/// Command-line surface. `config` points at an optional TOML file; any flag that is
/// present overrides the corresponding field from that file (or the built-in default
/// if no file was given).
#[derive(Debug, Parser)]
#[command(name = "memc-server", about = "A memcached-protocol-compatible cache server")]
pub struct Cli {
    /// Optional path to a TOML config file.
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub autoreload: Option<bool>,

    #[arg(long)]
    pub slowdown: Option<f64>,

    #[arg(long)]
    pub extra_stats: Option<bool>,

    /// Raise log verbosity; may be repeated.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(autoreload) = self.autoreload {
            config.general.autoreload = autoreload;
        }
        if let Some(slowdown) = self.slowdown {
            config.worker.slowdown = slowdown;
        }
        if let Some(extra_stats) = self.extra_stats {
            config.stats.extra_stats = extra_stats;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.server.port, 11211);
        assert!(config.general.autoreload);
        assert_eq!(config.worker.slowdown, 0.0);
        assert!(config.stats.extra_stats);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config: Config = toml::from_str("[server]\nport = 12000\n").unwrap();
        assert_eq!(config.server.port, 12000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.general.autoreload);
    }

    #[test]
    fn cli_overrides_config() {
        let mut config = Config::default();
        let cli = Cli {
            config: None,
            port: Some(9999),
            autoreload: None,
            slowdown: Some(0.5),
            extra_stats: Some(false),
            verbose: 0,
        };
        cli.apply(&mut config);
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.worker.slowdown, 0.5);
        assert!(!config.stats.extra_stats);
        assert!(config.general.autoreload);
    }
}
