//! Package graph data model.

pub mod names;
pub mod package;
pub mod resources;
pub mod server;
pub mod types;

pub use names::{PackageList, PackageName, PackageRef};
pub use package::{
    Binary, BuildPlan, Facet, Integration, Invocation, Package, PackageDefinition, PackageType,
    SecretSpec, Test,
};
pub use resources::{
    is_runtime_resource, is_secret_resource, is_server_resource, scoped_id,
    ExpectedResourceInstance, InputResource, ResourceClass, ResourceClassSpec, ResourceInputSpec,
    ResourceInstance, ResourceInstanceSpec, ResourcePack, ResourceProvider, ResourceProviderSpec,
    ResourceSpec, RUNTIME_PACKAGE,
};
pub use server::{
    sort_services, Allocation, AllocationInstance, Container, DeployableClass, EnvValue, EnvVar,
    EnvironmentRequirement, Framework, FrameworkExt, HttpPath, Instantiate, Mount, Need, Node,
    NodeKind, ProvidedType, Server, ServerFragment, ServiceSpec, Volume, VolumeKind,
};
pub use types::{
    FieldDescriptor, FieldKind, MessageType, TypeRegistry, TypedValue, UserType,
    FILE_CONTENTS_TYPE, PACKAGE_REF_TYPE,
};
