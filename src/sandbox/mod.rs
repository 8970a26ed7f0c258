//! Sandbox module - isolated, resource-capped execution containers
//!
//! - spec.rs: fixed sandbox policy derived from a language spec
//! - stream.rs: stdin delivery, framed output reading and relay
//! - docker.rs: Docker implementation of [`ContainerRuntime`] via bollard

mod docker;
#[cfg(test)]
pub(crate) mod fake;
mod spec;
mod stream;

pub use docker::DockerRuntime;
pub use spec::{
    build_spec, BindMount, ResourceLimits, SandboxSpec, Ulimit, CORE_DUMP_LIMIT,
    FILE_SIZE_LIMIT_BYTES, FINGERPRINT_LABEL, MANAGED_LABEL, MEMORY_LIMIT_BYTES, PIDS_LIMIT,
    WORKING_DIR,
};
pub use stream::{
    relay_output, ChannelSink, Frame, FrameReader, FrameStream, OutputSink, RelaySummary,
    StdinChannel, StreamTag,
};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::registry::LanguageRegistry;

/// Lifecycle state of a sandbox, in the order states are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Created,
    Attached,
    Started,
    Running,
    Exited,
    Removed,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxState::Created => "created",
            SandboxState::Attached => "attached",
            SandboxState::Started => "started",
            SandboxState::Running => "running",
            SandboxState::Exited => "exited",
            SandboxState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// A created sandbox and the lifecycle state it has reached
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    id: String,
    state: SandboxState,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        SandboxHandle {
            id: id.into(),
            state: SandboxState::Created,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Short id for log lines
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SandboxState::Exited | SandboxState::Removed)
    }

    /// Move forward to `next`. States never go backwards.
    pub fn advance(&mut self, next: SandboxState) -> Result<()> {
        if next <= self.state {
            return Err(Error::Internal(format!(
                "sandbox {} cannot move from {} to {}",
                self.short_id(),
                self.state,
                next
            )));
        }
        debug!("sandbox {}: {} -> {}", self.short_id(), self.state, next);
        self.state = next;
        Ok(())
    }
}

/// A container as reported by the runtime
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
    pub created: i64,
    pub labels: HashMap<String, String>,
}

/// Container runtime operations consumed by the orchestrator
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime name for logs
    fn name(&self) -> &str;

    /// Readiness probe; returns the server version
    async fn ping(&self) -> Result<String>;

    /// Pull an image so later creates do not block on it
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a sandbox
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle>;

    /// Attach to the sandbox's standard input
    async fn attach_stdin(&self, id: &str) -> Result<StdinChannel>;

    /// Attach to the sandbox's combined stdout/stderr
    async fn attach_output(&self, id: &str) -> Result<FrameStream>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Force-remove a sandbox, killing it if running
    async fn remove(&self, id: &str) -> Result<()>;

    /// All sandboxes known to the runtime
    async fn list(&self) -> Result<Vec<SandboxSummary>>;
}

/// Constant-interval backoff that gives up after a fixed number of retries
#[derive(Debug, Clone)]
struct FixedAttempts {
    interval: Duration,
    max_retries: u32,
    retries: u32,
}

impl backoff::backoff::Backoff for FixedAttempts {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        self.retries += 1;
        Some(self.interval)
    }
}

/// Probe the runtime until it answers, at most `attempts` times with
/// `interval` between probes.
pub async fn wait_until_ready(
    runtime: &dyn ContainerRuntime,
    attempts: u32,
    interval: Duration,
) -> Result<String> {
    let policy = FixedAttempts {
        interval,
        max_retries: attempts.saturating_sub(1),
        retries: 0,
    };

    info!("Waiting for {} daemon", runtime.name());
    let version = backoff::future::retry_notify(
        policy,
        move || async move { runtime.ping().await.map_err(backoff::Error::transient) },
        |err: Error, wait: Duration| {
            warn!(
                "{} daemon connectivity issue: {} (retrying in {:?})",
                runtime.name(),
                err,
                wait
            );
        },
    )
    .await
    .map_err(|e| {
        Error::Connectivity(format!(
            "{} unreachable after {} attempts: {}",
            runtime.name(),
            attempts,
            e
        ))
    })?;

    info!("{} daemon: {}", runtime.name(), version);
    Ok(version)
}

/// Outcome of an image prefetch pass
#[derive(Debug, Default)]
pub struct PrefetchReport {
    pub pulled: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Pull every image the registry references. Failures are logged and the
/// pass moves on to the next image.
pub async fn prefetch_images(
    runtime: &dyn ContainerRuntime,
    registry: &LanguageRegistry,
) -> PrefetchReport {
    let mut report = PrefetchReport::default();
    for image in registry.images() {
        info!("Pulling {}", image);
        match runtime.pull_image(image).await {
            Ok(()) => report.pulled.push(image.to_string()),
            Err(e) => {
                let err = Error::ImagePull {
                    image: image.to_string(),
                    message: e.to_string(),
                };
                error!("{}", err);
                report.failed.push((image.to_string(), e.to_string()));
            }
        }
    }
    info!(
        "Image prefetch done: {} pulled, {} failed",
        report.pulled.len(),
        report.failed.len()
    );
    report
}
