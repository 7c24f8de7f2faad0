//! Package name resolution
//!
//! A package name resolves, in order, through the static rewrites, the
//! workspace module, local replaces, declared dependencies and finally the
//! loader's [`MissingModuleResolver`]. Module prefixes match on whole path
//! segments; when several match, the longest one wins.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::loader::Loader;
use crate::module::{Location, Module};
use crate::schema::PackageName;
use keel_pm::{Dependency, LocalModule, ModuleFetcher, WorkspaceDocument, API_VERSION, WORKSPACE_FILENAME};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

/// Maps an alias prefix to a path within another module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRewrite {
    pub alias: String,
    pub module: String,
    pub rel: String,
}

/// Rewrites every loader starts with.
pub fn static_rewrites() -> Vec<ModuleRewrite> {
    vec![ModuleRewrite {
        alias: "library.keel.dev".to_string(),
        module: "keel.dev/library".to_string(),
        rel: String::new(),
    }]
}

/// Apply the first matching rewrite to `name`.
pub fn rewrite_package(rewrites: &[ModuleRewrite], name: &PackageName) -> PackageName {
    for rewrite in rewrites {
        if let Some(rest) = name.rel_to(&rewrite.alias) {
            let parts = [rewrite.module.as_str(), rewrite.rel.as_str(), rest.as_str()];
            let joined: Vec<&str> = parts
                .iter()
                .copied()
                .filter(|p| !p.is_empty() && *p != ".")
                .collect();
            return PackageName::new(joined.join("/"));
        }
    }

    name.clone()
}

/// Pick the item whose module is the longest prefix of `name`, along with
/// the package path relative to it.
fn longest_match<'a, T>(items: &'a [T], module_of: impl Fn(&T) -> &str, name: &PackageName) -> Option<(&'a T, String)> {
    items
        .iter()
        .filter_map(|item| name.rel_to(module_of(item)).map(|rel| (item, rel)))
        .max_by_key(|(item, _)| module_of(item).len())
}

/// Decides what to do with packages whose module is not declared
pub trait MissingModuleResolver: Send + Sync {
    fn resolve(&self, ctx: &Context, name: &PackageName) -> Result<Dependency>;
}

/// Fails with a hint to declare the dependency.
#[derive(Debug, Clone)]
pub struct TidyRequired {
    definition_file: PathBuf,
}

impl TidyRequired {
    pub fn new(definition_file: PathBuf) -> Self {
        TidyRequired { definition_file }
    }
}

impl MissingModuleResolver for TidyRequired {
    fn resolve(&self, _ctx: &Context, name: &PackageName) -> Result<Dependency> {
        Err(Error::usage(
            format!(
                "missing dependency, its module is not declared in {}",
                self.definition_file.display()
            ),
            format!("run `keelpm tidy {}` to add it", name),
        )
        .at(name))
    }
}

/// Discovers the hosting module and pins it to its current version,
/// remembering every dependency it added.
pub struct DiscoveringResolver {
    fetcher: Arc<dyn ModuleFetcher>,
    added: Mutex<Vec<Dependency>>,
}

impl DiscoveringResolver {
    pub fn new(fetcher: Arc<dyn ModuleFetcher>) -> Self {
        DiscoveringResolver {
            fetcher,
            added: Mutex::new(Vec::new()),
        }
    }

    /// Dependencies added so far, in discovery order.
    pub fn added(&self) -> Vec<Dependency> {
        self.added.lock().clone()
    }
}

impl MissingModuleResolver for DiscoveringResolver {
    fn resolve(&self, ctx: &Context, name: &PackageName) -> Result<Dependency> {
        let mut added = self.added.lock();

        // A module added earlier may already cover the package.
        if let Some((dep, _)) = longest_match(added.as_slice(), |d| d.module.as_str(), name) {
            return Ok(dep.clone());
        }

        let dep = self
            .fetcher
            .resolve_module_version(ctx, name.as_str())
            .map_err(|e| Error::from(e).at(name))?;

        tracing::info!(module = %dep.module, version = %dep.version, "discovered dependency");
        added.push(dep.clone());
        Ok(dep)
    }
}

impl Loader {
    pub(crate) fn resolve_name(&self, ctx: &Context, original: &PackageName) -> Result<Location> {
        original.validate()?;
        ctx.check()?;

        let name = rewrite_package(&self.rewrites, original);

        if let Some(rel) = name.rel_to(self.root.name()) {
            return Ok(self.root.make_location(&rel));
        }

        if let Some((replace, rel)) = longest_match(self.root.replaces(), |r| r.module.as_str(), &name) {
            let module = self.resolve_external(ctx, &replace.module, || {
                Ok(LocalModule {
                    module_name: replace.module.clone(),
                    version: String::new(),
                    path: self.workspace_dir.join(&replace.path),
                })
            })?;
            return Ok(module.make_location(&rel));
        }

        if let Some((dep, _)) = longest_match(self.root.dependencies(), |d| d.module.as_str(), &name) {
            return self.external_location(ctx, dep, &name);
        }

        let dep = self.missing.resolve(ctx, &name)?;
        self.external_location(ctx, &dep, &name)
    }

    fn external_location(&self, ctx: &Context, dep: &Dependency, name: &PackageName) -> Result<Location> {
        let rel = name.rel_to(&dep.module).ok_or_else(|| {
            Error::internal(format!("module {} does not contain the package", dep.module)).at(name)
        })?;

        let module = self.resolve_external(ctx, &dep.module, || {
            self.fetcher
                .download(ctx, dep, false)
                .map_err(|e| Error::from(e).at(&dep.module))
        })?;

        Ok(module.make_location(&rel))
    }

    /// Find a module, materializing it with `download` on first use.
    fn resolve_external(
        &self,
        ctx: &Context,
        module_name: &str,
        download: impl FnOnce() -> Result<LocalModule>,
    ) -> Result<Arc<Module>> {
        if let Some(module) = self.lookup_module(module_name) {
            return Ok(module);
        }

        ctx.check()?;
        let local = download()?;

        let document_path = local.path.join(WORKSPACE_FILENAME);
        if !document_path.exists() {
            return Err(Error::bad_input(format!(
                "{} is not a workspace, {} missing",
                local.path.display(),
                WORKSPACE_FILENAME
            ))
            .at(module_name));
        }

        let document = WorkspaceDocument::from_file(&document_path).map_err(|e| Error::from(e).at(module_name))?;

        if document.module != module_name {
            return Err(Error::internal(format!(
                "inconsistent definition, module specified {:?}, got {:?}",
                module_name, document.module
            ))
            .at(module_name));
        }

        document
            .check_api_requirements(API_VERSION)
            .map_err(|e| Error::from(e).at(module_name))?;

        tracing::debug!(module = %module_name, version = %local.version, path = %local.path.display(), "loaded module");
        Ok(self.inject_module(Module::new(document, local.path, local.version)))
    }
}
