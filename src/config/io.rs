//! Configuration I/O
//!
//! Reads the configuration file and overlays environment variables.

use std::path::Path;
use std::time::Duration;

use super::types::Config;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file if it exists, otherwise defaults
/// 2. Environment variable overrides (including `.env`)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    let config: Config = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") | Some("json5") => json5::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?,
        Some("toml") => toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?,
        _ => json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?,
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` first so values there behave like real environment
/// variables. Env vars have the highest precedence below CLI flags.
pub fn apply_env_overrides(config: &mut Config) {
    dotenvy::dotenv().ok();
    apply_overrides(config, |key| std::env::var(key).ok());
}

/// Overlay values returned by `lookup` for the `OPENCOMPILER_*` keys.
/// Unparseable values are ignored.
pub(crate) fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(bind) = lookup("OPENCOMPILER_BIND") {
        config.server.bind = bind;
    }
    if let Some(port) = lookup("OPENCOMPILER_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = port;
    }
    if let Some(path) = lookup("OPENCOMPILER_LANGUAGES") {
        config.registry.path = path.into();
    }
    if let Some(root) = lookup("OPENCOMPILER_STAGING_ROOT") {
        config.staging.root = root.into();
    }

    if let Some(attempts) = lookup("OPENCOMPILER_DOCKER_ATTEMPTS").and_then(|v| v.parse().ok()) {
        config.docker.connect_attempts = attempts;
    }
    if let Some(interval) = lookup("OPENCOMPILER_DOCKER_INTERVAL").and_then(|v| parse_duration(&v)) {
        config.docker.connect_interval = interval;
    }
    if let Some(prefetch) = lookup("OPENCOMPILER_PREFETCH_IMAGES").and_then(|v| parse_bool(&v)) {
        config.docker.prefetch_images = prefetch;
    }

    if let Some(timeout) = lookup("OPENCOMPILER_TIMEOUT").and_then(|v| parse_duration(&v)) {
        config.execution.timeout = timeout;
    }
    if let Some(buffer) = lookup("OPENCOMPILER_OUTPUT_BUFFER").and_then(|v| v.parse().ok()) {
        config.execution.output_buffer = buffer;
    }

    if let Some(level) = lookup("OPENCOMPILER_LOG_LEVEL") {
        config.log.level = level;
    }
    if let Some(format) = lookup("OPENCOMPILER_LOG_FORMAT").and_then(|v| v.parse().ok()) {
        config.log.format = format;
    }
}

fn parse_duration(value: &str) -> Option<Duration> {
    humantime_serde::re::humantime::parse_duration(value).ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
