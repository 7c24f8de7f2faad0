//! Resource classes, providers and instances.
//!
//! The `*Spec` types are what a package declares. [`ResourceClass`],
//! [`ResourceProvider`] and [`ResourceInstance`] are their resolved forms,
//! filled in during finalization.

use super::names::{PackageName, PackageRef};
use super::package::Invocation;
use super::types::{TypedValue, UserType};
use serde::{Deserialize, Serialize};

/// Package defining the primitive resource classes
pub const RUNTIME_PACKAGE: &str = "keel.dev/library/runtime";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClassSpec {
    pub name: String,
    /// Owning package; stamped during finalization
    #[serde(default)]
    pub package_name: PackageName,
    pub intent_type: String,
    pub instance_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<PackageName>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInputSpec {
    pub name: String,
    pub class: PackageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_resource: Option<PackageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProviderSpec {
    /// Owning package; stamped during finalization
    #[serde(default)]
    pub package_name: PackageName,
    pub provides_class: PackageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialized_with: Option<Invocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<ResourceInputSpec>,
    /// Overrides the intent type of the provided class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pack: Option<ResourcePack>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputResource {
    pub name: String,
    pub resource_ref: PackageRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInstanceSpec {
    /// Owning package; stamped during finalization
    #[serde(default)]
    pub package_name: PackageName,
    pub name: String,
    pub class: PackageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<PackageName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_from: Option<Invocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputResource>,
}

/// References to existing resources plus inline instances
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePack {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_refs: Vec<PackageRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<ResourceInstanceSpec>,
}

impl ResourcePack {
    pub fn is_empty(&self) -> bool {
        self.resource_refs.is_empty() && self.instances.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceClass {
    pub reference: PackageRef,
    pub spec: ResourceClassSpec,
    pub default_provider: Option<PackageName>,
    pub intent_type: UserType,
    pub instance_type: UserType,
}

impl ResourceClass {
    pub fn package_name(&self) -> &PackageName {
        &self.reference.package_name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedResourceInstance {
    pub name: String,
    pub class: ResourceClass,
    pub default_resource: Option<PackageRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceProvider {
    pub spec: ResourceProviderSpec,
    pub provider_id: String,
    pub class: ResourceClass,
    /// Intent type instances of this provider are parsed with
    pub intent_type: UserType,
    /// Statically declared resources
    pub resources: Vec<ResourceInstance>,
    pub inputs: Vec<ExpectedResourceInstance>,
}

impl ResourceProvider {
    pub fn lookup_expected(&self, name: &str) -> Option<&ExpectedResourceInstance> {
        self.inputs.iter().find(|x| x.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub source: ResourceInstanceSpec,
    pub intent: Option<TypedValue>,
    pub intent_type: Option<UserType>,
    pub class: ResourceClass,
    pub provider: Option<ResourceProvider>,
    /// Resources passed to the provider
    pub inputs: Vec<ResourceInstance>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInstance {
    pub resource_id: String,
    pub reference: PackageRef,
    pub spec: ResourceSpec,
}

/// Whether `class` is one of the primitive runtime classes.
pub fn is_runtime_resource(class: &PackageRef) -> bool {
    let pkg = class.package_name.as_str();
    pkg == RUNTIME_PACKAGE || pkg == "library.keel.dev/runtime"
}

pub fn is_server_resource(class: &PackageRef) -> bool {
    is_runtime_resource(class) && class.name == "Server"
}

pub fn is_secret_resource(class: &PackageRef) -> bool {
    is_runtime_resource(class) && class.name == "Secret"
}

/// Identifier of a resource, scoped by the resource that declares it.
pub fn scoped_id(parent: &str, name: &PackageRef) -> String {
    if parent.is_empty() {
        name.canonical()
    } else {
        format!("{}/{}", parent, name.canonical())
    }
}
