//! Workspace dependency document (keel.workspace.toml)
//!
//! Records the module name of a workspace, the pinned versions of the
//! modules it depends on, local replace overrides, prebuilt binary digests and
//! environment definitions.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the workspace document at the root of every module.
pub const WORKSPACE_FILENAME: &str = "keel.workspace.toml";

/// API version implemented by this build. Modules may require a minimum.
pub const API_VERSION: u32 = 60;

/// Errors that can occur while reading or writing a workspace document
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Failed to read or write the document
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse workspace document: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize TOML
    #[error("Failed to serialize workspace document: {0}")]
    SerializeError(String),

    /// Validation error
    #[error("Invalid workspace document: {0}")]
    ValidationError(String),

    /// The module requires a newer API than this build implements
    #[error("{module}: requires API version {required}, but this build implements {current}; please update")]
    UnsupportedApi {
        module: String,
        required: u32,
        current: u32,
    },
}

/// Workspace document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceDocument {
    /// Module name, e.g. `example.com/app`
    pub module: String,

    /// API requirements of the module
    #[serde(default, skip_serializing_if = "Requirements::is_empty")]
    pub requirements: Requirements,

    /// Pinned module dependencies
    #[serde(default, rename = "dependency", skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,

    /// Local overrides for module dependencies
    #[serde(default, rename = "replace", skip_serializing_if = "Vec::is_empty")]
    pub replaces: Vec<Replace>,

    /// Digests of prebuilt binaries, keyed by package
    #[serde(default, rename = "prebuilt_binary", skip_serializing_if = "Vec::is_empty")]
    pub prebuilt_binaries: Vec<BinaryDigest>,

    /// Environment definitions
    #[serde(default, rename = "environment", skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<EnvironmentSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Requirements {
    /// Minimum API version a build must implement to load this module
    #[serde(default, skip_serializing_if = "is_zero")]
    pub minimum_api: u32,
}

impl Requirements {
    fn is_empty(&self) -> bool {
        self.minimum_api == 0
    }
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// A module pinned at a version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub module: String,
    pub version: String,
}

/// A module served from a local path instead of a downloaded version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Replace {
    pub module: String,
    /// Path relative to the workspace root
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinaryDigest {
    pub package_name: String,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentSpec {
    pub name: String,
    pub runtime: String,
    #[serde(default)]
    pub purpose: Purpose,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    #[default]
    Development,
    Testing,
    Production,
}

impl WorkspaceDocument {
    /// Create a document for a new module with no dependencies
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Default::default()
        }
    }

    /// Parse a document from a file
    pub fn from_file(path: &Path) -> Result<Self, WorkspaceError> {
        let content = std::fs::read_to_string(path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Parse a document from a string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, WorkspaceError> {
        let doc: WorkspaceDocument = toml::from_str(content)?;
        doc.validate()?;
        Ok(doc)
    }

    /// Validate the document
    pub fn validate(&self) -> Result<(), WorkspaceError> {
        if !is_valid_module_name(&self.module) {
            return Err(WorkspaceError::ValidationError(format!(
                "Invalid module name: {:?}. Must be a domain followed by optional path segments",
                self.module
            )));
        }

        for dep in &self.dependencies {
            if !is_valid_module_name(&dep.module) {
                return Err(WorkspaceError::ValidationError(format!(
                    "Invalid dependency module name: {:?}",
                    dep.module
                )));
            }
            if dep.version.is_empty() {
                return Err(WorkspaceError::ValidationError(format!(
                    "Dependency '{}' has empty version",
                    dep.module
                )));
            }
        }

        for replace in &self.replaces {
            if replace.path.is_empty() {
                return Err(WorkspaceError::ValidationError(format!(
                    "Replace for '{}' has empty path",
                    replace.module
                )));
            }
        }

        Ok(())
    }

    /// Fail if the module requires a newer API than `current`
    pub fn check_api_requirements(&self, current: u32) -> Result<(), WorkspaceError> {
        if self.requirements.minimum_api > current {
            return Err(WorkspaceError::UnsupportedApi {
                module: self.module.clone(),
                required: self.requirements.minimum_api,
                current,
            });
        }
        Ok(())
    }

    /// Look up the pinned dependency for a module
    pub fn dependency(&self, module: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.module == module)
    }

    /// Returns a copy with `dep` pinned, replacing any existing version
    pub fn with_dependency(&self, dep: Dependency) -> Self {
        let mut copy = self.clone();
        match copy.dependencies.iter_mut().find(|d| d.module == dep.module) {
            Some(existing) => existing.version = dep.version,
            None => copy.dependencies.push(dep),
        }
        copy
    }

    /// Sort every list for diff-stable output
    pub fn sort(&mut self) {
        self.dependencies
            .sort_by(|a, b| a.module.cmp(&b.module).then_with(|| a.version.cmp(&b.version)));
        self.replaces
            .sort_by(|a, b| a.module.cmp(&b.module).then_with(|| a.path.cmp(&b.path)));
        self.prebuilt_binaries
            .sort_by(|a, b| a.package_name.cmp(&b.package_name));
    }

    /// Render the document with sorted lists
    pub fn to_toml_string(&self) -> Result<String, WorkspaceError> {
        let mut sorted = self.clone();
        sorted.sort();
        toml::to_string_pretty(&sorted).map_err(|e| WorkspaceError::SerializeError(e.to_string()))
    }

    /// Write the document to a file
    pub fn to_file(&self, path: &Path) -> Result<(), WorkspaceError> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Find the workspace root by walking up from `start_dir`
pub fn find_workspace_root(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;

    loop {
        if current.join(WORKSPACE_FILENAME).exists() {
            return Some(current.to_path_buf());
        }

        current = current.parent()?;
    }
}

/// A module name is a dotted domain optionally followed by path segments.
pub fn is_valid_module_name(name: &str) -> bool {
    let mut segments = name.split('/');
    let domain = match segments.next() {
        Some(d) => d,
        None => return false,
    };

    if !domain.contains('.') || !is_valid_segment(domain) {
        return false;
    }

    segments.all(is_valid_segment)
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document() {
        let toml = r#"
module = "example.com/app"

[requirements]
minimum_api = 42

[[dependency]]
module = "library.example.dev/std"
version = "0123456789abcdef"

[[replace]]
module = "example.com/shared"
path = "../shared"
"#;

        let doc = WorkspaceDocument::from_str(toml).unwrap();
        assert_eq!(doc.module, "example.com/app");
        assert_eq!(doc.requirements.minimum_api, 42);
        assert_eq!(doc.dependencies.len(), 1);
        assert_eq!(doc.replaces[0].path, "../shared");
    }

    #[test]
    fn test_invalid_module_name() {
        let result = WorkspaceDocument::from_str(r#"module = "not a domain""#);
        assert!(matches!(result, Err(WorkspaceError::ValidationError(_))));
    }

    #[test]
    fn test_module_name_validation() {
        assert!(is_valid_module_name("example.com"));
        assert!(is_valid_module_name("github.com/org/repo"));
        assert!(!is_valid_module_name("localhost/app"));
        assert!(!is_valid_module_name("example.com//app"));
        assert!(!is_valid_module_name("example.com/app/"));
        assert!(!is_valid_module_name(""));
    }

    #[test]
    fn test_api_requirements() {
        let mut doc = WorkspaceDocument::new("example.com/app");
        doc.requirements.minimum_api = API_VERSION + 1;
        assert!(matches!(
            doc.check_api_requirements(API_VERSION),
            Err(WorkspaceError::UnsupportedApi { .. })
        ));

        doc.requirements.minimum_api = API_VERSION;
        assert!(doc.check_api_requirements(API_VERSION).is_ok());
    }

    #[test]
    fn test_with_dependency_updates_in_place() {
        let doc = WorkspaceDocument::new("example.com/app").with_dependency(Dependency {
            module: "example.com/lib".to_string(),
            version: "aaa".to_string(),
        });

        let updated = doc.with_dependency(Dependency {
            module: "example.com/lib".to_string(),
            version: "bbb".to_string(),
        });

        assert_eq!(updated.dependencies.len(), 1);
        assert_eq!(updated.dependency("example.com/lib").unwrap().version, "bbb");
        // original untouched
        assert_eq!(doc.dependency("example.com/lib").unwrap().version, "aaa");
    }
}
