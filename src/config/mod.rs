//! Configuration module
//!
//! - types/mod.rs: core configuration types (Config, ServerConfig, ...)
//! - types/sandbox.rs: Docker connection and execution limits
//! - io.rs: loading and environment overrides
//! - validation.rs: configuration validation
//! - paths.rs: configuration file paths

mod io;
mod paths;
mod types;
mod validation;

pub use types::{
    Config, DockerConfig, ExecutionConfig, LogConfig, LogFormat, RegistryConfig, ServerConfig,
    StagingConfig,
};

pub use io::{apply_env_overrides, load_config, load_config_from_path};
pub use paths::{config_dir, config_path};
pub use validation::{validate_config, ConfigValidationResult, Severity, ValidationIssue};
