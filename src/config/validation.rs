//! Startup checks over a loaded [`Config`].
//!
//! Every problem is collected rather than failing on the first one, so the
//! operator sees the whole list in one run. Errors stop startup; warnings
//! are logged and ignored.

use std::fmt;

use super::types::Config;

/// How much a finding matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One finding against a dotted config key such as `execution.timeout`.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub path: &'static str,
    pub message: String,
    pub hint: Option<&'static str>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(hint) = self.hint {
            write!(f, " ({})", hint)?;
        }
        Ok(())
    }
}

/// All findings for a config, in check order.
#[derive(Debug, Clone, Default)]
pub struct ConfigValidationResult {
    issues: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// True when no finding is an error.
    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.of(Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.of(Severity::Warning)
    }

    fn of(&self, severity: Severity) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(move |i| i.severity == severity)
    }

    fn report(
        &mut self,
        severity: Severity,
        path: &'static str,
        message: impl Into<String>,
        hint: Option<&'static str>,
    ) {
        self.issues.push(ValidationIssue {
            severity,
            path,
            message: message.into(),
            hint,
        });
    }

    fn error(&mut self, path: &'static str, message: impl Into<String>) {
        self.report(Severity::Error, path, message, None);
    }

    fn error_with_hint(&mut self, path: &'static str, message: impl Into<String>, hint: &'static str) {
        self.report(Severity::Error, path, message, Some(hint));
    }

    fn warning(&mut self, path: &'static str, message: impl Into<String>) {
        self.report(Severity::Warning, path, message, None);
    }
}

/// Check a config before the service starts.
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::default();

    check_server(config, &mut result);
    check_registry(config, &mut result);
    check_execution(config, &mut result);

    result
}

fn check_server(config: &Config, result: &mut ConfigValidationResult) {
    if config.server.bind.trim().is_empty() {
        result.error_with_hint(
            "server.bind",
            "bind address is empty",
            "use 0.0.0.0 to listen on all interfaces",
        );
    }
    if config.server.port == 0 {
        result.warning("server.port", "port 0 binds a random port");
    }
}

fn check_registry(config: &Config, result: &mut ConfigValidationResult) {
    let path = &config.registry.path;
    if !path.exists() {
        result.error_with_hint(
            "registry.path",
            format!("language registry not found: {}", path.display()),
            "set OPENCOMPILER_LANGUAGES or pass --languages",
        );
    }
}

fn check_execution(config: &Config, result: &mut ConfigValidationResult) {
    if config.execution.timeout.is_zero() {
        result.error_with_hint(
            "execution.timeout",
            "execution timeout must be positive",
            "use a value such as \"30s\"",
        );
    }
    if config.execution.output_buffer == 0 {
        result.error(
            "execution.output_buffer",
            "output buffer must hold at least one chunk",
        );
    }
    if config.docker.connect_attempts == 0 {
        result.error(
            "docker.connect_attempts",
            "at least one connection attempt is required",
        );
    }
}
