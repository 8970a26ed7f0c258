//! Docker and execution configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Docker daemon connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Readiness probes before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Pause between readiness probes
    #[serde(default = "default_connect_interval", with = "humantime_serde")]
    pub connect_interval: Duration,

    /// Pull every registry image at startup
    #[serde(default = "default_true")]
    pub prefetch_images: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        DockerConfig {
            connect_attempts: default_connect_attempts(),
            connect_interval: default_connect_interval(),
            prefetch_images: true,
        }
    }
}

fn default_connect_attempts() -> u32 {
    30
}

fn default_connect_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

/// Per-request execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Wall-clock deadline for stdin delivery and for output relay
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Output chunks buffered between a sandbox and its HTTP response
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            timeout: default_timeout(),
            output_buffer: default_output_buffer(),
        }
    }
}

fn default_timeout() -> Duration {
    crate::orchestrator::DEFAULT_TIMEOUT
}

fn default_output_buffer() -> usize {
    32
}
