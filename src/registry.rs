//! Language registry
//!
//! Immutable mapping from language identifier to the image and commands used
//! to run it. Parsed once at startup from a YAML file of the form:
//!
//! ```yaml
//! language:
//!   python3:
//!     name: Python 3
//!     docker_image: python:3.12-slim
//!     build_cmd: []
//!     run_cmd: [python3, main.py]
//!     code_file: main.py
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// How to build and run code for one language
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageSpec {
    /// Display name
    pub name: String,
    /// Runtime image reference
    pub docker_image: String,
    /// Build command tokens (empty when the language is interpreted)
    #[serde(default)]
    pub build_cmd: Vec<String>,
    /// Run command tokens, executed in the working directory
    pub run_cmd: Vec<String>,
    /// Name of the file the source code is stored as
    pub code_file: String,
}

impl LanguageSpec {
    /// Whether a separate compile phase is needed before running
    pub fn requires_build(&self) -> bool {
        !self.build_cmd.is_empty()
    }
}

/// Read-only language registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguageRegistry {
    #[serde(rename = "language", default)]
    languages: BTreeMap<String, LanguageSpec>,
}

impl LanguageRegistry {
    /// Load the registry from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Cannot read languages file {}: {}",
                path.display(),
                e
            ))
        })?;
        let registry = Self::from_yaml(&content)?;
        info!(
            "Loaded {} languages from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Parse the registry from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let registry: LanguageRegistry = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Cannot parse languages file: {}", e)))?;
        registry.validate()?;
        for (id, spec) in &registry.languages {
            debug!("language {} -> {} ({})", id, spec.name, spec.docker_image);
        }
        Ok(registry)
    }

    /// Look up a language by identifier
    pub fn get(&self, id: &str) -> Result<&LanguageSpec> {
        self.languages
            .get(id)
            .ok_or_else(|| Error::UnknownLanguage(id.to_string()))
    }

    /// Iterate over all registered languages
    pub fn iter(&self) -> impl Iterator<Item = (&str, &LanguageSpec)> {
        self.languages.iter().map(|(id, spec)| (id.as_str(), spec))
    }

    /// Distinct runtime images referenced by the registry
    pub fn images(&self) -> Vec<&str> {
        let mut images: Vec<&str> = self
            .languages
            .values()
            .map(|spec| spec.docker_image.as_str())
            .collect();
        images.sort_unstable();
        images.dedup();
        images
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }

    fn validate(&self) -> Result<()> {
        for (id, spec) in &self.languages {
            if spec.docker_image.trim().is_empty() {
                return Err(Error::Config(format!("language {}: docker_image is empty", id)));
            }
            if spec.run_cmd.is_empty() {
                return Err(Error::Config(format!("language {}: run_cmd is empty", id)));
            }
            if !is_plain_file_name(&spec.code_file) {
                return Err(Error::Config(format!(
                    "language {}: code_file {:?} must be a plain file name",
                    id, spec.code_file
                )));
            }
        }
        Ok(())
    }
}

/// `code_file` is joined onto the artifact directory, so it must not escape it
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
