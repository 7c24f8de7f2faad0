//! Packages and their auxiliary definitions.

use super::names::{PackageName, PackageRef};
use super::resources::{
    ResourceClass, ResourceClassSpec, ResourceInstance, ResourceInstanceSpec, ResourceProvider,
    ResourceProviderSpec,
};
use super::server::{EnvVar, Node, NodeKind, Server, ServerFragment, Volume};
use super::types::MessageType;
use crate::error::{Error, Result};
use crate::module::Location;
use serde::{Deserialize, Serialize};

/// Kind of a package, derived from its facets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    None,
    Extension,
    Service,
    Server,
    Binary,
    Test,
}

/// The primary facet of a package; a package has at most one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    #[default]
    None,
    Server(Server),
    Node(Node),
    Fragment(ServerFragment),
}

/// A call into a binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub binary: PackageRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// How a binary is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPlan {
    Go { package: String },
    Nodejs { entrypoint: String },
    Dockerfile { path: String },
    Image { reference: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binary {
    pub name: String,
    /// Stamped during finalization
    #[serde(default)]
    pub package_name: PackageName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_plan: Option<BuildPlan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

impl Binary {
    pub fn new(name: impl Into<String>, build_plan: BuildPlan) -> Self {
        Binary {
            name: name.into(),
            package_name: PackageName::default(),
            build_plan: Some(build_plan),
            command: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<PackageRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers_under_test: Vec<PackageName>,
}

/// Build integration applied to a server, e.g. `dockerfile`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A package as produced by a frontend, before it is placed at a location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageDefinition {
    #[serde(default)]
    pub facet: Facet,
    #[serde(default)]
    pub binaries: Vec<Binary>,
    #[serde(default)]
    pub tests: Vec<Test>,
    #[serde(default)]
    pub types: Vec<MessageType>,
    #[serde(default)]
    pub integration: Option<Integration>,
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub resource_classes: Vec<ResourceClassSpec>,
    #[serde(default)]
    pub resource_providers: Vec<ResourceProviderSpec>,
    #[serde(default)]
    pub resources: Vec<ResourceInstanceSpec>,
}

impl PackageDefinition {
    pub fn into_package(self, location: Location) -> Package {
        Package {
            location,
            facet: self.facet,
            binaries: self.binaries,
            tests: self.tests,
            types: self.types,
            integration: self.integration,
            secrets: self.secrets,
            volumes: self.volumes,
            resource_class_specs: self.resource_classes,
            resource_provider_specs: self.resource_providers,
            resource_instance_specs: self.resources,
            resource_classes: Vec::new(),
            resource_providers: Vec::new(),
            resources: Vec::new(),
        }
    }
}

/// The unit of configuration
#[derive(Debug, Clone)]
pub struct Package {
    pub location: Location,
    pub facet: Facet,
    pub binaries: Vec<Binary>,
    pub tests: Vec<Test>,
    /// Message types declared by the package
    pub types: Vec<MessageType>,
    pub integration: Option<Integration>,
    pub secrets: Vec<SecretSpec>,
    pub volumes: Vec<Volume>,

    // Raw resource definitions
    pub resource_class_specs: Vec<ResourceClassSpec>,
    pub resource_provider_specs: Vec<ResourceProviderSpec>,
    pub resource_instance_specs: Vec<ResourceInstanceSpec>,

    // Resolved during finalization
    pub resource_classes: Vec<ResourceClass>,
    pub resource_providers: Vec<ResourceProvider>,
    pub resources: Vec<ResourceInstance>,
}

impl Package {
    /// An empty package at `location`.
    pub fn new(location: Location) -> Self {
        PackageDefinition::default().into_package(location)
    }

    pub fn package_name(&self) -> &PackageName {
        &self.location.package_name
    }

    pub fn server(&self) -> Option<&Server> {
        match &self.facet {
            Facet::Server(server) => Some(server),
            _ => None,
        }
    }

    pub fn node(&self) -> Option<&Node> {
        match &self.facet {
            Facet::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn fragment(&self) -> Option<&ServerFragment> {
        match &self.facet {
            Facet::Fragment(fragment) => Some(fragment),
            _ => None,
        }
    }

    pub fn package_type(&self) -> PackageType {
        match &self.facet {
            Facet::Server(_) => PackageType::Server,
            Facet::Node(node) if node.kind == NodeKind::Extension => PackageType::Extension,
            Facet::Node(_) => PackageType::Service,
            Facet::Fragment(_) | Facet::None => {
                if !self.binaries.is_empty() {
                    PackageType::Binary
                } else if !self.tests.is_empty() {
                    PackageType::Test
                } else {
                    PackageType::None
                }
            }
        }
    }

    /// Look a binary up by name. An empty name selects the only binary.
    pub fn lookup_binary(&self, name: &str) -> Result<&Binary> {
        if let Some(binary) = self.binaries.iter().find(|b| b.name == name) {
            return Ok(binary);
        }

        if name.is_empty() && self.binaries.len() == 1 {
            return Ok(&self.binaries[0]);
        }

        Err(Error::bad_input(format!("no such binary {:?}", name)).at(self.package_name()))
    }

    pub fn lookup_resource_class(&self, name: &str) -> Option<&ResourceClass> {
        self.resource_classes.iter().find(|rc| rc.spec.name == name)
    }

    pub fn lookup_resource_provider(&self, class: &PackageRef) -> Option<&ResourceProvider> {
        self.resource_providers
            .iter()
            .find(|p| &p.spec.provides_class == class)
    }

    pub fn lookup_resource_instance(&self, name: &str) -> Option<&ResourceInstance> {
        self.resources.iter().find(|r| r.reference.name == name)
    }

    pub fn lookup_secret(&self, name: &str) -> Option<&SecretSpec> {
        self.secrets.iter().find(|s| s.name == name)
    }
}
