//! Docker container runtime
//!
//! Drives sandboxes through the Docker Engine API: create with resource
//! ceilings and a bind mount, attach stdin and output separately, start,
//! and force-remove on failure. Containers are created with auto-remove so a
//! normal exit needs no explicit cleanup.

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, ResourcesUlimits};
use bollard::Docker;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::sandbox::stream::{Frame, FrameStream, StdinChannel, StreamTag};
use crate::sandbox::{wait_until_ready, ContainerRuntime, SandboxHandle, SandboxSpec, SandboxSummary};

/// Docker-backed sandbox runtime
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the default socket)
    /// without probing the daemon.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Connectivity(format!("Failed to connect to Docker: {}", e)))?;
        Ok(DockerRuntime { docker })
    }

    /// Connect and wait until the daemon answers, retrying at a fixed
    /// interval up to `attempts` times.
    pub async fn connect_with_backoff(attempts: u32, interval: Duration) -> Result<Self> {
        let runtime = Self::connect()?;
        wait_until_ready(&runtime, attempts, interval).await?;
        Ok(runtime)
    }
}

impl From<&SandboxSpec> for Config<String> {
    fn from(spec: &SandboxSpec) -> Self {
        let ulimits = spec
            .limits
            .ulimits
            .iter()
            .map(|u| ResourcesUlimits {
                name: Some(u.name.to_string()),
                soft: Some(u.soft),
                hard: Some(u.hard),
            })
            .collect();

        let host_config = HostConfig {
            mounts: Some(vec![Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(spec.mount.source.to_string_lossy().into_owned()),
                target: Some(spec.mount.target.clone()),
                read_only: Some(spec.mount.read_only),
                ..Default::default()
            }]),
            memory: Some(spec.limits.memory_bytes),
            pids_limit: Some(spec.limits.pids),
            ulimits: Some(ulimits),
            network_mode: spec.network_disabled.then(|| "none".to_string()),
            auto_remove: Some(spec.auto_remove),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.working_dir.clone()),
            cmd: Some(spec.command.clone()),
            network_disabled: Some(spec.network_disabled),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(spec.attach_stdout),
            attach_stderr: Some(spec.attach_stderr),
            open_stdin: Some(spec.open_stdin),
            stdin_once: Some(spec.stdin_once),
            tty: Some(spec.tty),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

fn frame_from_log(output: LogOutput) -> Frame {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            Frame::new(StreamTag::Stdout, message)
        }
        LogOutput::StdErr { message } => Frame::new(StreamTag::Stderr, message),
        LogOutput::StdIn { message } => Frame::new(StreamTag::Stdin, message),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn ping(&self) -> Result<String> {
        self.docker.ping().await?;
        let version = self.docker.version().await?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| Error::ImagePull {
                image: image.to_string(),
                message: e.to_string(),
            })?;
            if let Some(status) = info.status {
                debug!("Pull {}: {}", image, status);
            }
        }

        info!("Image {} ready", image);
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let config: Config<String> = spec.into();
        let response = self
            .docker
            .create_container::<String, String>(None, config)
            .await?;
        for warning in &response.warnings {
            debug!("create {}: {}", response.id, warning);
        }
        Ok(SandboxHandle::new(response.id))
    }

    async fn attach_stdin(&self, id: &str) -> Result<StdinChannel> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { input, .. } =
            self.docker.attach_container(id, Some(options)).await?;
        Ok(StdinChannel::from_pinned(input))
    }

    async fn attach_output(&self, id: &str) -> Result<FrameStream> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { output, .. } =
            self.docker.attach_container(id, Some(options)).await?;
        Ok(output
            .map(|item| item.map(frame_from_log).map_err(Error::from))
            .boxed())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        debug!("Removed container {}", id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SandboxSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .map(|c| SandboxSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
                created: c.created.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }
}
