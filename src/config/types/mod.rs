//! Configuration types
//!
//! Every section has per-field serde defaults so a partial file (or no file
//! at all) yields a usable configuration.

pub mod sandbox;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use sandbox::{DockerConfig, ExecutionConfig};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Language registry file
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Artifact staging area
    #[serde(default)]
    pub staging: StagingConfig,

    /// Docker daemon connection
    #[serde(default)]
    pub docker: DockerConfig,

    /// Per-request execution limits
    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load from the default locations with environment overrides applied
    pub fn from_env() -> crate::error::Result<Self> {
        crate::config::load_config()
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// `bind:port` for the listener
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Where the language registry lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            path: default_registry_path(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("./languages.yaml")
}

/// Artifact staging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Root directory; one subdirectory per fingerprint
    #[serde(default = "default_staging_root")]
    pub root: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        StagingConfig {
            root: default_staging_root(),
        }
    }
}

fn default_staging_root() -> PathBuf {
    std::env::temp_dir().join("opencompiler")
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info,opencompiler=debug".to_string()
}
