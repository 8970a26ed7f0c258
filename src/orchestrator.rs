//! Execution orchestrator
//!
//! Runs one request through a fixed sequence of stages:
//!
//! ```text
//! validate -> fingerprint -> ensure artifact -> build spec -> create
//!   -> attach stdin -> attach output -> start -> write stdin + relay
//! ```
//!
//! Stdin delivery and output relay run together so neither side of the
//! sandbox can block the other.
//!
//! Stages run strictly in order, nothing is retried, and the first failure
//! ends the request. Once a sandbox exists, every failure path force-removes
//! it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::artifact::{fingerprint, ArtifactStore, Fingerprint};
use crate::error::{Error, Result};
use crate::registry::{LanguageRegistry, LanguageSpec};
use crate::sandbox::{
    build_spec, relay_output, ContainerRuntime, FrameStream, OutputSink, RelaySummary,
    SandboxHandle, SandboxState, StdinChannel,
};

/// Default execution deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pipeline stage, used for logging and error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ValidateFields,
    ComputeFingerprint,
    EnsureArtifact,
    BuildSandboxSpec,
    CreateSandbox,
    AttachStdin,
    AttachOutput,
    StartSandbox,
    WriteStdin,
    RelayOutput,
    Complete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::ValidateFields => "validate fields",
            Stage::ComputeFingerprint => "compute fingerprint",
            Stage::EnsureArtifact => "ensure artifact",
            Stage::BuildSandboxSpec => "build sandbox spec",
            Stage::CreateSandbox => "create sandbox",
            Stage::AttachStdin => "attach stdin",
            Stage::AttachOutput => "attach output",
            Stage::StartSandbox => "start sandbox",
            Stage::WriteStdin => "write stdin",
            Stage::RelayOutput => "relay output",
            Stage::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Body of `POST /run`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub stdin: String,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        ExecutionRequest {
            language: language.into(),
            code: code.into(),
            stdin: String::new(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }
}

/// Composes registry, artifact store and container runtime
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<LanguageRegistry>,
    store: ArtifactStore,
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        store: ArtifactStore,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Orchestrator {
            registry,
            store,
            runtime,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the execution deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    /// Check required fields and resolve the language
    pub fn validate(&self, request: &ExecutionRequest) -> Result<&LanguageSpec> {
        if request.language.is_empty() {
            return Err(Error::InvalidInput("language is empty".to_string()));
        }
        if request.code.is_empty() {
            return Err(Error::InvalidInput("code is empty".to_string()));
        }
        self.registry.get(&request.language)
    }

    /// Run every stage up to starting the sandbox. Stdin has not been
    /// delivered and no output has been read yet; both happen in
    /// [`RunningSandbox::relay`].
    pub async fn launch(&self, request: &ExecutionRequest) -> Result<RunningSandbox> {
        let language = self.validate(request)?;

        let fingerprint = fingerprint(&request.language, &request.code);
        debug!(
            "{}: language={} fingerprint={}",
            Stage::ComputeFingerprint,
            request.language,
            fingerprint
        );

        let artifact = self
            .store
            .ensure_artifact(&fingerprint, language, &request.code)
            .await?;

        let spec = build_spec(language, &artifact.dir);
        debug!("{}: image={} cmd={:?}", Stage::BuildSandboxSpec, spec.image, spec.command);

        let mut handle = self
            .runtime
            .create(&spec)
            .await
            .map_err(|e| Error::sandbox(Stage::CreateSandbox, e))?;
        info!(
            "Created sandbox {} for {} ({})",
            handle.short_id(),
            request.language,
            fingerprint
        );

        match self.attach_and_start(&mut handle).await {
            Ok((input, output)) => Ok(RunningSandbox {
                handle,
                input,
                stdin: Bytes::from(request.stdin.clone().into_bytes()),
                output,
                runtime: self.runtime.clone(),
                timeout: self.timeout,
                fingerprint,
                started: Instant::now(),
            }),
            Err(e) => {
                warn!("Sandbox {} failed: {}", handle.short_id(), e);
                teardown(self.runtime.as_ref(), &mut handle).await;
                Err(e)
            }
        }
    }

    /// Launch, deliver stdin and relay all output into `sink`
    pub async fn run<S>(&self, request: &ExecutionRequest, sink: &mut S) -> Result<RelaySummary>
    where
        S: OutputSink + ?Sized,
    {
        self.launch(request).await?.relay(sink).await
    }

    async fn attach_and_start(
        &self,
        handle: &mut SandboxHandle,
    ) -> Result<(StdinChannel, FrameStream)> {
        // Attach before start so no early output is lost
        let input = self
            .runtime
            .attach_stdin(handle.id())
            .await
            .map_err(|e| Error::sandbox(Stage::AttachStdin, e))?;
        let output = self
            .runtime
            .attach_output(handle.id())
            .await
            .map_err(|e| Error::sandbox(Stage::AttachOutput, e))?;
        handle.advance(SandboxState::Attached)?;

        self.runtime
            .start(handle.id())
            .await
            .map_err(|e| Error::sandbox(Stage::StartSandbox, e))?;
        handle.advance(SandboxState::Started)?;

        Ok((input, output))
    }
}

/// A started sandbox waiting for its stdin and output relay
pub struct RunningSandbox {
    handle: SandboxHandle,
    input: StdinChannel,
    stdin: Bytes,
    output: FrameStream,
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
    fingerprint: Fingerprint,
    started: Instant,
}

impl RunningSandbox {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Deliver stdin and relay output into `sink` until the process exits
    /// or the deadline passes. On any failure the sandbox is force-removed.
    ///
    /// Output is drained while stdin is still being written, so a process
    /// that echoes its input cannot stall on a full output pipe.
    pub async fn relay<S>(self, sink: &mut S) -> Result<RelaySummary>
    where
        S: OutputSink + ?Sized,
    {
        let RunningSandbox {
            mut handle,
            input,
            stdin,
            output,
            runtime,
            timeout,
            started,
            ..
        } = self;

        if let Err(e) = handle.advance(SandboxState::Running) {
            teardown(runtime.as_ref(), &mut handle).await;
            return Err(e);
        }

        let deliver = async {
            input
                .deliver(&stdin)
                .await
                .map_err(|e| Error::sandbox(Stage::WriteStdin, e))
        };
        let relay = async {
            relay_output(output, sink).await.map_err(|e| match e {
                Error::Stream(_) => e,
                other => Error::Stream(other.to_string()),
            })
        };

        let remaining = timeout.saturating_sub(started.elapsed());
        let result = tokio::time::timeout(remaining, async {
            tokio::try_join!(deliver, relay).map(|(_, summary)| summary)
        })
        .await;

        match result {
            Ok(Ok(summary)) => {
                handle.advance(SandboxState::Exited)?;
                info!(
                    "Sandbox {} exited: {} stdout bytes, {} stderr bytes in {:?}",
                    handle.short_id(),
                    summary.stdout_bytes,
                    summary.stderr_bytes,
                    started.elapsed()
                );
                Ok(summary)
            }
            Ok(Err(e)) => {
                warn!("Sandbox {} failed: {}", handle.short_id(), e);
                teardown(runtime.as_ref(), &mut handle).await;
                Err(e)
            }
            Err(_) => {
                warn!("Sandbox {} exceeded {:?}, removing", handle.short_id(), timeout);
                teardown(runtime.as_ref(), &mut handle).await;
                Err(Error::Timeout(timeout))
            }
        }
    }
}

/// Force-remove a sandbox that did not reach a terminal state on its own
async fn teardown(runtime: &dyn ContainerRuntime, handle: &mut SandboxHandle) {
    if handle.is_terminal() {
        return;
    }
    match runtime.remove(handle.id()).await {
        Ok(()) => {
            let _ = handle.advance(SandboxState::Removed);
        }
        Err(e) => warn!("Failed to remove sandbox {}: {}", handle.short_id(), e),
    }
}
