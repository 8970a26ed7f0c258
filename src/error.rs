//! Error types for OpenCompiler

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::orchestrator::Stage;

/// Result type alias using OpenCompiler's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for OpenCompiler
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or language registry error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Container runtime unreachable
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Image prefetch failed
    #[error("Failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },

    /// Missing or malformed request field
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Language identifier not present in the registry
    #[error("Unknown language: {0}")]
    UnknownLanguage(String),

    /// Language needs a build step that this service does not run
    #[error("Language {0} requires a build step before it can run")]
    BuildRequired(String),

    /// Artifact could not be persisted
    #[error("Failed to write artifact {path}: {source}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A sandbox lifecycle stage failed
    #[error("Sandbox error during {stage}: {message}")]
    Sandbox { stage: Stage, message: String },

    /// Output or input stream failure
    #[error("Stream error: {0}")]
    Stream(String),

    /// Execution deadline exceeded
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    /// Docker/container error
    #[error("Container error: {0}")]
    Container(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error classification exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request itself is at fault
    Validation,
    /// Something failed on our side
    Internal,
}

/// Error body returned to HTTP callers
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    /// Create a sandbox stage error
    pub fn sandbox(stage: Stage, err: impl std::fmt::Display) -> Self {
        Error::Sandbox {
            stage,
            message: err.to_string(),
        }
    }

    /// Check if error is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_) | Error::UnknownLanguage(_) | Error::BuildRequired(_)
        )
    }

    /// Caller-visible classification
    pub fn kind(&self) -> ErrorKind {
        if self.is_client_error() {
            ErrorKind::Validation
        } else {
            ErrorKind::Internal
        }
    }

    /// Message that is safe to hand to an untrusted caller.
    ///
    /// Validation messages are built from caller input only. Everything else
    /// collapses to a stage-level description so host paths and runtime
    /// diagnostics stay in the logs.
    pub fn safe_message(&self) -> String {
        match self {
            Error::InvalidInput(msg) => msg.clone(),
            Error::UnknownLanguage(lang) => format!("unknown language: {}", lang),
            Error::BuildRequired(lang) => {
                format!("language {} must be built before it can run", lang)
            }
            Error::ArtifactWrite { .. } => "failed to store source code".to_string(),
            Error::Sandbox { stage, .. } => format!("sandbox failed during {}", stage),
            Error::Stream(_) => "failed to relay sandbox output".to_string(),
            Error::Timeout(limit) => format!("execution exceeded {}s", limit.as_secs()),
            _ => "internal error".to_string(),
        }
    }

    /// Build the caller-facing envelope
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            kind: self.kind(),
            message: self.safe_message(),
        }
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Container(err.to_string())
    }
}
