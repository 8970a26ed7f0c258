//! Sandbox container specification
//!
//! Every language runs under the same fixed policy: no network, the artifact
//! directory bind-mounted onto a constant working directory, and the same
//! memory, process-count, file-size and core-dump ceilings.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::registry::LanguageSpec;

/// Working directory inside every sandbox
pub const WORKING_DIR: &str = "/workspace";

/// Memory ceiling in bytes (512 MiB)
pub const MEMORY_LIMIT_BYTES: i64 = 512 * 1024 * 1024;

/// Maximum number of processes/threads
pub const PIDS_LIMIT: i64 = 64;

/// Largest file the sandboxed process may write, in bytes
pub const FILE_SIZE_LIMIT_BYTES: i64 = 10_000_000;

/// Core dumps are disabled
pub const CORE_DUMP_LIMIT: i64 = 0;

/// Label marking containers created by this service
pub const MANAGED_LABEL: &str = "opencompiler.managed";

/// Label carrying the artifact fingerprint
pub const FINGERPRINT_LABEL: &str = "opencompiler.fingerprint";

/// A soft/hard rlimit pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ulimit {
    pub name: &'static str,
    pub soft: i64,
    pub hard: i64,
}

impl Ulimit {
    fn fixed(name: &'static str, value: i64) -> Self {
        Ulimit {
            name,
            soft: value,
            hard: value,
        }
    }
}

/// Resource ceilings applied to the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub pids: i64,
    pub ulimits: Vec<Ulimit>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            memory_bytes: MEMORY_LIMIT_BYTES,
            pids: PIDS_LIMIT,
            ulimits: vec![
                Ulimit::fixed("nproc", PIDS_LIMIT),
                Ulimit::fixed("fsize", FILE_SIZE_LIMIT_BYTES),
                Ulimit::fixed("core", CORE_DUMP_LIMIT),
            ],
        }
    }
}

impl ResourceLimits {
    /// Look up a ulimit by name
    pub fn ulimit(&self, name: &str) -> Option<&Ulimit> {
        self.ulimits.iter().find(|u| u.name == name)
    }
}

/// Host directory mounted into the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Request-scoped container configuration
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSpec {
    pub image: String,
    pub working_dir: String,
    pub command: Vec<String>,
    pub network_disabled: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub open_stdin: bool,
    /// Stdin closes after the first attached client detaches
    pub stdin_once: bool,
    pub tty: bool,
    pub mount: BindMount,
    pub limits: ResourceLimits,
    /// Container removes itself when the process exits
    pub auto_remove: bool,
    pub labels: HashMap<String, String>,
}

/// Build the sandbox configuration for running `language` against the
/// artifact in `artifact_dir`.
pub fn build_spec(language: &LanguageSpec, artifact_dir: &Path) -> SandboxSpec {
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    if let Some(name) = artifact_dir.file_name() {
        labels.insert(
            FINGERPRINT_LABEL.to_string(),
            name.to_string_lossy().into_owned(),
        );
    }

    SandboxSpec {
        image: language.docker_image.clone(),
        working_dir: WORKING_DIR.to_string(),
        command: language.run_cmd.clone(),
        network_disabled: true,
        attach_stdin: true,
        attach_stdout: true,
        attach_stderr: true,
        open_stdin: true,
        stdin_once: true,
        tty: false,
        mount: BindMount {
            source: artifact_dir.to_path_buf(),
            target: WORKING_DIR.to_string(),
            read_only: false,
        },
        limits: ResourceLimits::default(),
        auto_remove: true,
        labels,
    }
}
