//! Shared fixtures: an in-memory frontend that counts parses and a fetcher
//! serving modules from local directories.

#![allow(dead_code)]

use keel_graph::schema::{
    Facet, Node, NodeKind, Package, PackageDefinition, PackageName, PackageType, Server,
};
use keel_graph::{Context, Error, Frontend, Loader, LoaderOptions, Location, PackageLoader, Result};
use keel_pm::{Cancellation, Dependency, FetchError, LocalModule, ModuleFetcher, WorkspaceDocument, WORKSPACE_FILENAME};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const ROOT: &str = "example.com/app";

/// Serves package definitions from memory
#[derive(Default)]
pub struct StubFrontend {
    definitions: Mutex<HashMap<String, PackageDefinition>>,
    parse_time_loads: Mutex<HashMap<String, Vec<String>>>,
    delays: Mutex<HashMap<String, Duration>>,
    parses: Mutex<HashMap<String, usize>>,
}

impl StubFrontend {
    pub fn new() -> Arc<Self> {
        Arc::new(StubFrontend::default())
    }

    pub fn define(&self, name: &str, definition: PackageDefinition) {
        self.definitions.lock().insert(name.to_string(), definition);
    }

    /// Load `deps` while parsing `name`, the way a frontend resolving
    /// imported types would.
    pub fn load_during_parse(&self, name: &str, deps: &[&str]) {
        self.parse_time_loads
            .lock()
            .insert(name.to_string(), deps.iter().map(|d| d.to_string()).collect());
    }

    pub fn delay(&self, name: &str, delay: Duration) {
        self.delays.lock().insert(name.to_string(), delay);
    }

    pub fn parses(&self, name: &str) -> usize {
        self.parses.lock().get(name).copied().unwrap_or(0)
    }

    pub fn total_parses(&self) -> usize {
        self.parses.lock().values().sum()
    }
}

impl Frontend for StubFrontend {
    fn parse_package(&self, ctx: &Context, loader: &dyn PackageLoader, location: &Location) -> Result<Package> {
        let name = location.package_name.to_string();
        *self.parses.lock().entry(name.clone()).or_default() += 1;

        let delay = self.delays.lock().get(&name).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        ctx.check()?;

        let deps = self.parse_time_loads.lock().get(&name).cloned().unwrap_or_default();
        for dep in deps {
            loader.load_by_name(ctx, &PackageName::new(dep))?;
        }

        let definition = self
            .definitions
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::bad_input("no such package").at(&name))?;

        Ok(definition.into_package(location.clone()))
    }

    fn guess_package_type(&self, ctx: &Context, loader: &dyn PackageLoader, name: &PackageName) -> Result<PackageType> {
        let definition = self.definitions.lock().get(name.as_str()).cloned();
        match definition {
            Some(definition) => {
                let location = loader.resolve(ctx, name)?;
                Ok(definition.into_package(location).package_type())
            }
            None => Ok(PackageType::None),
        }
    }
}

/// Serves modules from directories registered up front
#[derive(Default)]
pub struct StubFetcher {
    modules: Mutex<HashMap<String, PathBuf>>,
    downloads: Mutex<Vec<Dependency>>,
}

impl StubFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(StubFetcher::default())
    }

    /// Create a module directory with a workspace document declaring
    /// `declared` as the module name.
    pub fn serve(&self, dir: &Path, module: &str, declared: &str) {
        write_workspace(dir, &WorkspaceDocument::new(declared));
        self.modules.lock().insert(module.to_string(), dir.to_path_buf());
    }

    pub fn serve_dir(&self, dir: &Path, module: &str) {
        std::fs::create_dir_all(dir).unwrap();
        self.modules.lock().insert(module.to_string(), dir.to_path_buf());
    }

    pub fn downloads(&self) -> Vec<Dependency> {
        self.downloads.lock().clone()
    }
}

impl ModuleFetcher for StubFetcher {
    fn download(&self, _cancel: &dyn Cancellation, dependency: &Dependency, _force: bool) -> std::result::Result<LocalModule, FetchError> {
        self.downloads.lock().push(dependency.clone());

        let path = self
            .modules
            .lock()
            .get(&dependency.module)
            .cloned()
            .ok_or_else(|| FetchError::UnknownModule(dependency.module.clone()))?;

        Ok(LocalModule {
            module_name: dependency.module.clone(),
            version: dependency.version.clone(),
            path,
        })
    }

    fn resolve_module_version(&self, _cancel: &dyn Cancellation, package_name: &str) -> std::result::Result<Dependency, FetchError> {
        let modules = self.modules.lock();
        let module = modules
            .keys()
            .filter(|m| package_name == m.as_str() || package_name.starts_with(&format!("{}/", m)))
            .max_by_key(|m| m.len())
            .cloned()
            .ok_or_else(|| FetchError::UnknownModule(package_name.to_string()))?;

        Ok(Dependency {
            module,
            version: "0123456789abcdef".to_string(),
        })
    }
}

pub fn write_workspace(dir: &Path, document: &WorkspaceDocument) {
    std::fs::create_dir_all(dir).unwrap();
    document.to_file(&dir.join(WORKSPACE_FILENAME)).unwrap();
}

pub fn new_loader(root_dir: &Path, document: WorkspaceDocument, frontend: Arc<StubFrontend>, fetcher: Arc<StubFetcher>) -> Loader {
    let options = LoaderOptions::new(frontend).with_fetcher(fetcher);
    Loader::new(root_dir.to_path_buf(), document, options).unwrap()
}

/// A loader for a bare `example.com/app` workspace.
pub fn root_loader(root_dir: &Path, frontend: Arc<StubFrontend>) -> Loader {
    new_loader(root_dir, WorkspaceDocument::new(ROOT), frontend, StubFetcher::new())
}

pub fn names(list: &[&str]) -> Vec<PackageName> {
    list.iter().map(|n| PackageName::new(*n)).collect()
}

pub fn service(imports: &[&str]) -> PackageDefinition {
    let mut node = Node::new(NodeKind::Service);
    node.imports = names(imports);
    PackageDefinition {
        facet: Facet::Node(node),
        ..Default::default()
    }
}

pub fn extension(imports: &[&str]) -> PackageDefinition {
    let mut node = Node::new(NodeKind::Extension);
    node.imports = names(imports);
    PackageDefinition {
        facet: Facet::Node(node),
        ..Default::default()
    }
}

pub fn server(name: &str, imports: &[&str]) -> PackageDefinition {
    PackageDefinition {
        facet: Facet::Server(Server {
            name: name.to_string(),
            imports: names(imports),
            ..Default::default()
        }),
        ..Default::default()
    }
}
