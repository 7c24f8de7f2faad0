//! Package names and references.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Fully-qualified package name, e.g. `example.com/app/frontend`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    /// Wrap a name without validating it.
    pub fn new(name: impl Into<String>) -> Self {
        PackageName(name.into())
    }

    /// Validate and wrap a name.
    pub fn parse(name: &str) -> Result<Self> {
        let name = PackageName::new(name);
        name.validate()?;
        Ok(name)
    }

    /// Reject empty and malformed names.
    pub fn validate(&self) -> Result<()> {
        let name = self.0.as_str();

        if name.is_empty() || name == "." {
            return Err(Error::bad_input(format!("bad package reference {:?}", name)));
        }

        if name.chars().any(char::is_whitespace) {
            return Err(Error::bad_input(format!(
                "bad package reference {:?}: contains whitespace",
                name
            )));
        }

        if name.split('/').any(|segment| segment.is_empty()) {
            return Err(Error::bad_input(format!(
                "bad package reference {:?}: empty path segment",
                name
            )));
        }

        if name.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(Error::bad_input(format!(
                "bad package reference {:?}: relative path segment",
                name
            )));
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Path of this package relative to `module`: `.` for the module
    /// itself, `None` when the package is not within the module.
    pub fn rel_to(&self, module: &str) -> Option<String> {
        if self.0 == module {
            return Some(".".to_string());
        }

        self.0
            .strip_prefix(module)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rel| !rel.is_empty())
            .map(|rel| rel.to_string())
    }

    /// Last path segment.
    pub fn base(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PackageName {
    fn from(s: &str) -> Self {
        PackageName::new(s)
    }
}

impl From<String> for PackageName {
    fn from(s: String) -> Self {
        PackageName(s)
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A named definition within a package, written `package:name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageRef {
    pub package_name: PackageName,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl PackageRef {
    pub fn new(package_name: impl Into<PackageName>, name: impl Into<String>) -> Self {
        PackageRef {
            package_name: package_name.into(),
            name: name.into(),
        }
    }

    /// Parse `name` (relative to `owner`) or `package:name`.
    pub fn parse(owner: &PackageName, value: &str) -> Result<Self> {
        let reference = match value.rsplit_once(':') {
            Some((pkg, name)) => PackageRef::new(pkg, name),
            None => PackageRef::new(owner.clone(), value),
        };

        if reference.name.is_empty() || reference.package_name.is_empty() {
            return Err(Error::bad_input(format!("invalid package reference {:?}", value)));
        }

        reference.package_name.validate()?;
        Ok(reference)
    }

    /// `package:name`, or `package` when the reference has no name.
    pub fn canonical(&self) -> String {
        if self.name.is_empty() {
            self.package_name.to_string()
        } else {
            format!("{}:{}", self.package_name, self.name)
        }
    }

    pub fn as_package_name(&self) -> &PackageName {
        &self.package_name
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Insertion-ordered set of package names.
#[derive(Debug, Clone, Default)]
pub struct PackageList {
    names: Vec<PackageName>,
    seen: HashSet<PackageName>,
}

impl PackageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `name`, returning whether it was not yet present.
    pub fn add(&mut self, name: PackageName) -> bool {
        if self.seen.contains(&name) {
            return false;
        }
        self.seen.insert(name.clone());
        self.names.push(name);
        true
    }

    pub fn extend<I: IntoIterator<Item = PackageName>>(&mut self, names: I) {
        for name in names {
            self.add(name);
        }
    }

    pub fn contains(&self, name: &PackageName) -> bool {
        self.seen.contains(name)
    }

    pub fn position(&self, name: &PackageName) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PackageName> {
        self.names.iter()
    }

    pub fn as_slice(&self) -> &[PackageName] {
        &self.names
    }

    pub fn into_vec(self) -> Vec<PackageName> {
        self.names
    }
}

impl FromIterator<PackageName> for PackageList {
    fn from_iter<I: IntoIterator<Item = PackageName>>(iter: I) -> Self {
        let mut list = PackageList::new();
        list.extend(iter);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(PackageName::parse("example.com/app").is_ok());
        assert!(PackageName::parse("").is_err());
        assert!(PackageName::parse(".").is_err());
        assert!(PackageName::parse("/example.com").is_err());
        assert!(PackageName::parse("example.com/").is_err());
        assert!(PackageName::parse("example.com//app").is_err());
        assert!(PackageName::parse("example.com/my app").is_err());
        assert!(PackageName::parse("example.com/app/../x").is_err());
        assert!(PackageName::parse("example.com/./app").is_err());
        assert!(PackageName::parse("..").is_err());
        assert!(PackageName::parse("example.com/app/..x").is_ok());
    }

    #[test]
    fn test_rel_to() {
        let name = PackageName::new("example.com/app/sub/x");
        assert_eq!(name.rel_to("example.com/app").as_deref(), Some("sub/x"));
        assert_eq!(name.rel_to("example.com/app/sub/x").as_deref(), Some("."));
        assert_eq!(name.rel_to("example.com/ap"), None);
        assert_eq!(name.rel_to("example.org"), None);
    }

    #[test]
    fn test_parse_ref() {
        let owner = PackageName::new("example.com/app");
        let local = PackageRef::parse(&owner, "db").unwrap();
        assert_eq!(local.canonical(), "example.com/app:db");

        let remote = PackageRef::parse(&owner, "example.com/lib:cache").unwrap();
        assert_eq!(remote.package_name.as_str(), "example.com/lib");
        assert_eq!(remote.name, "cache");

        assert!(PackageRef::parse(&owner, "example.com/lib:").is_err());
        assert!(PackageRef::parse(&owner, ":x").is_err());
    }

    #[test]
    fn test_package_list_keeps_insertion_order() {
        let mut list = PackageList::new();
        assert!(list.add("b.com/x".into()));
        assert!(list.add("a.com/y".into()));
        assert!(!list.add("b.com/x".into()));
        let names: Vec<_> = list.iter().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["b.com/x", "a.com/y"]);
    }
}
