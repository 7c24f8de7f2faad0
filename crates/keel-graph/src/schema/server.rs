//! Servers, nodes and server fragments.

use super::names::{PackageName, PackageRef};
use super::resources::ResourcePack;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime framework a server or service is implemented with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    #[default]
    Unspecified,
    Go,
    Nodejs,
    Web,
    Opaque,
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Framework::Unspecified => "UNSPECIFIED",
            Framework::Go => "GO",
            Framework::Nodejs => "NODEJS",
            Framework::Web => "WEB",
            Framework::Opaque => "OPAQUE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Service,
    Extension,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployableClass {
    #[default]
    Stateless,
    Stateful,
}

impl fmt::Display for DeployableClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployableClass::Stateless => f.write_str("stateless"),
            DeployableClass::Stateful => f.write_str("stateful"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Sort services by container port, then by name.
pub fn sort_services(services: &mut [ServiceSpec]) {
    services.sort_by(|a, b| a.port.cmp(&b.port).then_with(|| a.name.cmp(&b.name)));
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeKind {
    #[default]
    Ephemeral,
    Persistent,
    Configurable,
    WorkspaceSync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    /// Package that defines the volume
    pub owner: PackageName,
    #[serde(default)]
    pub kind: VolumeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Package that defines the mount
    pub owner: PackageName,
    pub path: String,
    pub volume_ref: PackageRef,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvValue {
    Literal(String),
    FromResourceField {
        resource: PackageRef,
        field_selector: String,
    },
    FromSecret(PackageRef),
    FromServerEndpoint(PackageName),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: EnvValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Binary the container runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PackageRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
}

/// Labels an environment must (not) carry for a server to be deployed to it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRequirement {
    /// Package imposing the requirement; stamped when merged into a server
    #[serde(default, skip_serializing_if = "PackageName::is_empty")]
    pub package: PackageName,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub has_label: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub does_not_have_label: Vec<String>,
}

/// Mergeable bundle of server configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFragment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<ServiceSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pack: Option<ResourcePack>,
    #[serde(default)]
    pub main_container: Container,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    /// Extensions the fragment composes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<PackageName>,
}

impl ServerFragment {
    /// Every container: main, then sidecars, then init containers.
    pub fn containers_mut(&mut self) -> impl Iterator<Item = &mut Container> {
        std::iter::once(&mut self.main_container)
            .chain(self.sidecars.iter_mut())
            .chain(self.init_containers.iter_mut())
    }

    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        std::iter::once(&self.main_container)
            .chain(self.sidecars.iter())
            .chain(self.init_containers.iter())
    }
}

/// A typed constructor call into another node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instantiate {
    pub name: String,
    /// Package providing the constructor; `None` for builtin constructors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<PackageName>,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidedType {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpPath {
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

/// Runtime allocation requested by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Need {
    Port { name: String },
}

/// A service or extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Stamped during finalization
    #[serde(default)]
    pub package_name: PackageName,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<PackageName>,
    /// Extensions the node composes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<PackageName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<ProvidedType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instantiate: Vec<Instantiate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exported_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exported_http: Vec<HttpPath>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<Need>,
    #[serde(default)]
    pub service_framework: Framework,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pack: Option<ResourcePack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_requirement: Option<EnvironmentRequirement>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Node {
            package_name: PackageName::default(),
            kind,
            imports: Vec::new(),
            extensions: Vec::new(),
            provides: Vec::new(),
            instantiate: Vec::new(),
            exported_services: Vec::new(),
            exported_http: Vec::new(),
            needs: Vec::new(),
            service_framework: Framework::Unspecified,
            volumes: Vec::new(),
            mounts: Vec::new(),
            resource_pack: None,
            environment_requirement: None,
        }
    }

    /// Imports followed by composed extensions, without repeats.
    pub fn imported_packages(&self) -> Vec<PackageName> {
        dedup(self.imports.iter().chain(self.extensions.iter()))
    }
}

/// Framework-specific configuration attached to a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkExt {
    pub kind: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Per-instantiation bindings, used to allocate runtime resources once per
/// instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub instances: Vec<AllocationInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInstance {
    pub owner: PackageName,
    pub package_name: PackageName,
    pub instantiated: Vec<Instantiate>,
    pub alloc_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downstream: Vec<Allocation>,
}

/// A deployable composition of nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Stamped during finalization
    #[serde(default)]
    pub package_name: PackageName,
    /// Stamped during finalization
    #[serde(default)]
    pub module_name: String,
    #[serde(default)]
    pub framework: Framework,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<PackageName>,
    /// Extensions embedded in the server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<PackageName>,
    /// Imports as declared, before framework and sealing additions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_imports: Vec<PackageName>,
    #[serde(default)]
    pub self_fragment: ServerFragment,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocation: Vec<Allocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment_requirements: Vec<EnvironmentRequirement>,
    #[serde(default)]
    pub deployable_class: DeployableClass,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub framework_ext: Vec<FrameworkExt>,
}

impl Server {
    /// Declared imports followed by embedded extensions, without repeats.
    pub fn imported_packages(&self) -> Vec<PackageName> {
        dedup(self.imports.iter().chain(self.extensions.iter()))
    }
}

fn dedup<'a>(names: impl Iterator<Item = &'a PackageName>) -> Vec<PackageName> {
    let mut out: Vec<PackageName> = Vec::new();
    for name in names {
        if !out.contains(name) {
            out.push(name.clone());
        }
    }
    out
}
