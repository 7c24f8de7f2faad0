//! Framework and integration handlers
//!
//! Both registries are built once and consulted by key: frameworks by the
//! server's [`Framework`], integrations by the kind named in the package.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::finalize::FinalizeEnv;
use crate::module::Location;
use crate::schema::{Binary, BuildPlan, Facet, Framework, FrameworkExt, Package, PackageName, PackageRef};
use crate::sealer::Sealed;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// What a framework adds to a server before its dependencies are loaded
#[derive(Debug, Clone, Default)]
pub struct ServerFrameworkExt {
    /// Packages every server of the framework depends on
    pub include: Vec<PackageName>,
    pub framework_specific: Option<FrameworkExt>,
}

/// Framework-specific server processing
pub trait FrameworkHandler: Send + Sync {
    fn pre_parse_server(&self, ctx: &Context, loc: &Location, ext: &mut ServerFrameworkExt) -> Result<()>;

    fn post_parse_server(&self, _ctx: &Context, _sealed: &mut Sealed) -> Result<()> {
        Ok(())
    }

    /// Packages needed to run servers of the framework in development
    fn development_packages(&self) -> Vec<PackageName> {
        Vec::new()
    }
}

/// Framework handlers keyed by framework
#[derive(Clone, Default)]
pub struct FrameworkRegistry {
    handlers: HashMap<Framework, Arc<dyn FrameworkHandler>>,
}

impl FrameworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, framework: Framework, handler: Arc<dyn FrameworkHandler>) {
        self.handlers.insert(framework, handler);
    }

    pub fn get(&self, framework: Framework) -> Option<&Arc<dyn FrameworkHandler>> {
        self.handlers.get(&framework)
    }

    /// Run the framework's pre-parse hook, if it has a handler.
    pub fn pre_parse_server(&self, ctx: &Context, framework: Framework, loc: &Location) -> Result<ServerFrameworkExt> {
        let mut ext = ServerFrameworkExt::default();
        if let Some(handler) = self.get(framework) {
            handler.pre_parse_server(ctx, loc, &mut ext)?;
        }
        Ok(ext)
    }

    pub fn development_packages(&self, framework: Framework) -> Vec<PackageName> {
        self.get(framework)
            .map(|h| h.development_packages())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for FrameworkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("FrameworkRegistry").field("frameworks", &keys).finish()
    }
}

/// Wires a build integration into a package
pub trait IntegrationHandler: Send + Sync {
    fn kind(&self) -> &str;

    fn apply(&self, ctx: &Context, env: &FinalizeEnv<'_>, pkg: &mut Package) -> Result<()>;
}

/// Integration handlers keyed by kind
#[derive(Clone, Default)]
pub struct IntegrationRegistry {
    handlers: HashMap<String, Arc<dyn IntegrationHandler>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `dockerfile`, `go` and `nodejs` integrations.
    pub fn with_builtins() -> Self {
        let mut registry = IntegrationRegistry::new();
        registry.register(Arc::new(DockerfileIntegration));
        registry.register(Arc::new(GoIntegration));
        registry.register(Arc::new(NodejsIntegration));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn IntegrationHandler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn IntegrationHandler>> {
        self.handlers.get(kind)
    }
}

impl std::fmt::Debug for IntegrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("IntegrationRegistry").field("kinds", &keys).finish()
    }
}

fn integration_data<T>(pkg: &Package) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    let data = match &pkg.integration {
        Some(integration) if !integration.data.is_null() => integration.data.clone(),
        _ => return Ok(T::default()),
    };

    serde_json::from_value(data)
        .map_err(|e| Error::bad_input(format!("invalid integration: {}", e)).at(pkg.package_name()))
}

/// Add a binary built with `plan` and run it as the server's main container.
fn wire_server_binary(pkg: &mut Package, plan: BuildPlan) -> Result<()> {
    let package_name = pkg.location.package_name.clone();

    let Facet::Server(server) = &mut pkg.facet else {
        return Err(Error::bad_input("integrations are only supported on servers").at(&package_name));
    };

    if server.self_fragment.main_container.binary.is_some() {
        return Err(Error::bad_input("server already has a binary, can't apply an integration").at(&package_name));
    }

    let name = if server.name.is_empty() {
        package_name.base().to_string()
    } else {
        server.name.clone()
    };

    if pkg.binaries.iter().any(|b| b.name == name) {
        return Err(Error::bad_input(format!("duplicate binary name {:?}", name)).at(&package_name));
    }

    server.self_fragment.main_container.binary = Some(PackageRef::new(package_name, name.clone()));
    pkg.binaries.push(Binary::new(name, plan));

    Ok(())
}

#[derive(Debug, Deserialize)]
struct DockerfileData {
    #[serde(default = "default_dockerfile")]
    dockerfile: String,
}

impl Default for DockerfileData {
    fn default() -> Self {
        DockerfileData {
            dockerfile: default_dockerfile(),
        }
    }
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

/// Builds the server from a Dockerfile in the package
pub struct DockerfileIntegration;

impl IntegrationHandler for DockerfileIntegration {
    fn kind(&self) -> &str {
        "dockerfile"
    }

    fn apply(&self, _ctx: &Context, _env: &FinalizeEnv<'_>, pkg: &mut Package) -> Result<()> {
        let data: DockerfileData = integration_data(pkg)?;
        wire_server_binary(pkg, BuildPlan::Dockerfile { path: data.dockerfile })
    }
}

#[derive(Debug, Deserialize)]
struct GoData {
    #[serde(default = "default_go_package")]
    package: String,
}

impl Default for GoData {
    fn default() -> Self {
        GoData {
            package: default_go_package(),
        }
    }
}

fn default_go_package() -> String {
    ".".to_string()
}

/// Builds the server from a Go package
pub struct GoIntegration;

impl IntegrationHandler for GoIntegration {
    fn kind(&self) -> &str {
        "go"
    }

    fn apply(&self, _ctx: &Context, _env: &FinalizeEnv<'_>, pkg: &mut Package) -> Result<()> {
        let data: GoData = integration_data(pkg)?;
        wire_server_binary(pkg, BuildPlan::Go { package: data.package })
    }
}

#[derive(Debug, Deserialize)]
struct NodejsData {
    #[serde(default = "default_entrypoint")]
    entrypoint: String,
}

impl Default for NodejsData {
    fn default() -> Self {
        NodejsData {
            entrypoint: default_entrypoint(),
        }
    }
}

fn default_entrypoint() -> String {
    "index.js".to_string()
}

/// Runs the server with node
pub struct NodejsIntegration;

impl IntegrationHandler for NodejsIntegration {
    fn kind(&self) -> &str {
        "nodejs"
    }

    fn apply(&self, _ctx: &Context, _env: &FinalizeEnv<'_>, pkg: &mut Package) -> Result<()> {
        let data: NodejsData = integration_data(pkg)?;
        wire_server_binary(pkg, BuildPlan::Nodejs { entrypoint: data.entrypoint })
    }
}
