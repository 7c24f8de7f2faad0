//! Modules and package locations.

use crate::schema::PackageName;
use keel_pm::{Dependency, Replace, WorkspaceDocument};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A versioned source tree holding packages
#[derive(Debug)]
pub struct Module {
    document: WorkspaceDocument,
    path: PathBuf,
    version: String,
}

impl Module {
    /// `version` is empty for modules that live in the workspace or are
    /// replaced by a local path.
    pub fn new(document: WorkspaceDocument, path: PathBuf, version: impl Into<String>) -> Self {
        Module {
            document,
            path,
            version: version.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.document.module
    }

    /// Absolute path of the module root
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_external(&self) -> bool {
        !self.version.is_empty()
    }

    pub fn document(&self) -> &WorkspaceDocument {
        &self.document
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.document.dependencies
    }

    pub fn replaces(&self) -> &[Replace] {
        &self.document.replaces
    }

    pub fn minimum_api(&self) -> u32 {
        self.document.requirements.minimum_api
    }

    /// Location of the package at `rel` (`.` for the module root).
    pub fn make_location(self: &Arc<Self>, rel: &str) -> Location {
        let package_name = if rel == "." || rel.is_empty() {
            PackageName::new(self.name())
        } else {
            PackageName::new(format!("{}/{}", self.name(), rel))
        };

        Location {
            module: self.clone(),
            rel_path: if rel.is_empty() { ".".to_string() } else { rel.to_string() },
            package_name,
        }
    }
}

/// Where a package lives: a module and a path within it
#[derive(Debug, Clone)]
pub struct Location {
    pub module: Arc<Module>,
    pub rel_path: String,
    pub package_name: PackageName,
}

impl Location {
    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    /// Absolute path of the package directory
    pub fn abs_path(&self) -> PathBuf {
        if self.rel_path == "." {
            self.module.path().to_path_buf()
        } else {
            self.module.path().join(&self.rel_path)
        }
    }

    /// Path of `file` relative to the package, refusing paths that leave
    /// the module.
    pub fn file(&self, file: &str) -> Option<PathBuf> {
        let rel = Path::new(file);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return None;
        }
        Some(self.abs_path().join(rel))
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.package_name == other.package_name
            && self.rel_path == other.rel_path
            && self.module.name() == other.module.name()
            && self.module.version() == other.module.version()
    }
}

impl Eq for Location {}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.package_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> Arc<Module> {
        Arc::new(Module::new(
            WorkspaceDocument::new("example.com/app"),
            PathBuf::from("/src/app"),
            "",
        ))
    }

    #[test]
    fn test_make_location() {
        let m = module();
        let root = m.make_location(".");
        assert_eq!(root.package_name.as_str(), "example.com/app");
        assert_eq!(root.abs_path(), PathBuf::from("/src/app"));

        let sub = m.make_location("sub/x");
        assert_eq!(sub.package_name.as_str(), "example.com/app/sub/x");
        assert_eq!(sub.rel_path, "sub/x");
        assert_eq!(sub.abs_path(), PathBuf::from("/src/app/sub/x"));
        assert!(!m.is_external());
    }

    #[test]
    fn test_file_stays_within_module() {
        let loc = module().make_location("server");
        assert_eq!(loc.file("config.json"), Some(PathBuf::from("/src/app/server/config.json")));
        assert_eq!(loc.file("../secrets"), None);
        assert_eq!(loc.file("/etc/passwd"), None);
    }
}
