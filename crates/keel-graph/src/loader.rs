//! Package loader
//!
//! Resolves package names to locations, parses packages through a
//! [`Frontend`] and finalizes them. Loads are memoized per loader: each
//! package is parsed at most once, however many threads ask for it
//! concurrently. The first caller for a package becomes its worker; every
//! other caller waits on a coordinator until the worker publishes a result.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::finalize::{finalize_package, FinalizeEnv};
use crate::framework::{FrameworkRegistry, IntegrationRegistry};
use crate::frontend::Frontend;
use crate::module::{Location, Module};
use crate::resolver::{rewrite_package, static_rewrites, MissingModuleResolver, ModuleRewrite, TidyRequired};
use crate::schema::{Package, PackageName, PackageType, TypeRegistry};
use crate::sealer::{seal, SealHelper, Sealed};
use crossbeam::channel::{self, Sender};
use crossbeam::select;
use keel_pm::{
    GitModuleFetcher, ModuleCache, ModuleFetcher, WorkspaceDocument, API_VERSION, WORKSPACE_FILENAME,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Something packages can be loaded from
pub trait PackageLoader: Send + Sync {
    /// Map a package name to where the package lives.
    fn resolve(&self, ctx: &Context, name: &PackageName) -> Result<Location>;

    /// Load, parse and finalize a package.
    fn load_by_name(&self, ctx: &Context, name: &PackageName) -> Result<Arc<Package>>;

    /// Load a package, discarding it.
    fn ensure(&self, ctx: &Context, name: &PackageName) -> Result<()> {
        self.load_by_name(ctx, name).map(|_| ())
    }
}

/// Loader configuration
pub struct LoaderOptions {
    frontend: Arc<dyn Frontend>,
    fetcher: Option<Arc<dyn ModuleFetcher>>,
    missing_module_resolver: Option<Arc<dyn MissingModuleResolver>>,
    frameworks: FrameworkRegistry,
    integrations: IntegrationRegistry,
    types: TypeRegistry,
    rewrites: Vec<ModuleRewrite>,
}

impl LoaderOptions {
    /// Options with the builtin integrations, the well-known types and the
    /// static module rewrites.
    pub fn new(frontend: Arc<dyn Frontend>) -> Self {
        LoaderOptions {
            frontend,
            fetcher: None,
            missing_module_resolver: None,
            frameworks: FrameworkRegistry::new(),
            integrations: IntegrationRegistry::with_builtins(),
            types: TypeRegistry::with_well_known(),
            rewrites: static_rewrites(),
        }
    }

    /// Fetcher for external modules. Defaults to git with the default cache.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ModuleFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Strategy for packages whose module is not declared. Defaults to
    /// [`TidyRequired`].
    pub fn with_missing_module_resolver(mut self, resolver: Arc<dyn MissingModuleResolver>) -> Self {
        self.missing_module_resolver = Some(resolver);
        self
    }

    pub fn with_frameworks(mut self, frameworks: FrameworkRegistry) -> Self {
        self.frameworks = frameworks;
        self
    }

    pub fn with_integrations(mut self, integrations: IntegrationRegistry) -> Self {
        self.integrations = integrations;
        self
    }

    pub fn with_types(mut self, types: TypeRegistry) -> Self {
        self.types = types;
        self
    }

    /// Resolve `alias` (and anything below it) within `module` at `rel`.
    pub fn with_rewrite(mut self, alias: impl Into<String>, module: impl Into<String>, rel: impl Into<String>) -> Self {
        self.rewrites.push(ModuleRewrite {
            alias: alias.into(),
            module: module.into(),
            rel: rel.into(),
        });
        self
    }
}

/// Loaded package and module counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub loaded_packages: usize,
    pub loaded_modules: usize,
    /// Loaded package names, per module name
    pub per_module: BTreeMap<String, Vec<String>>,
}

#[derive(Default)]
struct LoaderState {
    loaded: HashMap<PackageName, Arc<Package>>,
    loading: HashMap<PackageName, Arc<LoadingPackage>>,
    modules: HashMap<String, Arc<Module>>,
}

/// Memoizing, concurrent package loader
pub struct Loader {
    pub(crate) workspace_dir: PathBuf,
    pub(crate) root: Arc<Module>,
    pub(crate) fetcher: Arc<dyn ModuleFetcher>,
    pub(crate) missing: Arc<dyn MissingModuleResolver>,
    pub(crate) rewrites: Vec<ModuleRewrite>,
    frontend: Arc<dyn Frontend>,
    frameworks: FrameworkRegistry,
    integrations: IntegrationRegistry,
    types: TypeRegistry,
    state: RwLock<LoaderState>,
    waits: Mutex<WaitGraph>,
}

impl Loader {
    /// Open the workspace rooted at `workspace_dir`.
    pub fn open(workspace_dir: &Path, options: LoaderOptions) -> Result<Loader> {
        let document = WorkspaceDocument::from_file(&workspace_dir.join(WORKSPACE_FILENAME))?;
        Loader::new(workspace_dir.to_path_buf(), document, options)
    }

    /// A loader for the workspace described by `document`, rooted at
    /// `workspace_dir`.
    pub fn new(workspace_dir: PathBuf, document: WorkspaceDocument, options: LoaderOptions) -> Result<Loader> {
        document.check_api_requirements(API_VERSION)?;

        let fetcher = match options.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(GitModuleFetcher::new(ModuleCache::default_cache().map_err(|e| {
                Error::invocation(format!("failed to open module cache: {}", e))
            })?)?),
        };

        let missing = match options.missing_module_resolver {
            Some(resolver) => resolver,
            None => Arc::new(TidyRequired::new(workspace_dir.join(WORKSPACE_FILENAME))),
        };

        let root = Arc::new(Module::new(document, workspace_dir.clone(), ""));

        let mut state = LoaderState::default();
        state.modules.insert(root.name().to_string(), root.clone());

        Ok(Loader {
            workspace_dir,
            root,
            fetcher,
            missing,
            rewrites: options.rewrites,
            frontend: options.frontend,
            frameworks: options.frameworks,
            integrations: options.integrations,
            types: options.types,
            state: RwLock::new(state),
            waits: Mutex::new(WaitGraph::default()),
        })
    }

    pub fn root_module(&self) -> &Arc<Module> {
        &self.root
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn frameworks(&self) -> &FrameworkRegistry {
        &self.frameworks
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn finalize_env(&self) -> FinalizeEnv<'_> {
        FinalizeEnv {
            loader: self,
            frameworks: &self.frameworks,
            integrations: &self.integrations,
            types: &self.types,
        }
    }

    /// Determine the kind of a package through the frontend.
    pub fn guess_package_type(&self, ctx: &Context, name: &PackageName) -> Result<PackageType> {
        self.frontend.guess_package_type(ctx, self, name)
    }

    /// Seal the dependency graph of `focus`.
    pub fn seal_package(&self, ctx: &Context, focus: &PackageName, helper: Option<&SealHelper>) -> Result<Sealed> {
        seal(ctx, self, &self.frameworks, focus, helper)
    }

    /// Point-in-time, read-only copy of everything loaded so far.
    pub fn seal(&self) -> SealedPackages {
        let state = self.state.read();

        SealedPackages {
            modules: state
                .modules
                .iter()
                .map(|(name, m)| (name.clone(), m.clone()))
                .collect(),
            packages: state
                .loaded
                .iter()
                .map(|(name, p)| (name.clone(), p.clone()))
                .collect(),
            rewrites: self.rewrites.clone(),
        }
    }

    pub fn stats(&self) -> LoaderStats {
        let state = self.state.read();

        let mut per_module: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pkg in state.loaded.values() {
            per_module
                .entry(pkg.location.module_name().to_string())
                .or_default()
                .push(pkg.package_name().to_string());
        }
        for names in per_module.values_mut() {
            names.sort();
        }

        LoaderStats {
            loaded_packages: state.loaded.len(),
            loaded_modules: state.modules.len(),
            per_module,
        }
    }

    pub(crate) fn lookup_module(&self, name: &str) -> Option<Arc<Module>> {
        self.state.read().modules.get(name).cloned()
    }

    /// Memoize `module` unless a module of the same name won a race to it.
    pub(crate) fn inject_module(&self, module: Module) -> Arc<Module> {
        let mut state = self.state.write();
        state
            .modules
            .entry(module.name().to_string())
            .or_insert_with(|| Arc::new(module))
            .clone()
    }

    fn load_package(&self, ctx: &Context, location: Location) -> Result<Arc<Package>> {
        let name = location.package_name.clone();

        let chain = ctx.loading_chain();
        if let Some(pos) = chain.iter().position(|p| p == name.as_str()) {
            let mut path = chain[pos..].to_vec();
            path.push(name.to_string());
            return Err(Error::CycleDetected { path });
        }

        loop {
            if let Some(pkg) = self.state.read().loaded.get(&name) {
                return Ok(pkg.clone());
            }

            let loading = {
                let mut state = self.state.write();
                if let Some(pkg) = state.loaded.get(&name) {
                    return Ok(pkg.clone());
                }
                state
                    .loading
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(LoadingPackage::new(location.clone())))
                    .clone()
            };

            if loading.claim() {
                return self.run_worker(ctx, &loading);
            }

            match loading.wait(ctx, self)? {
                LoadOutcome::Loaded(pkg) => return Ok(pkg),
                LoadOutcome::Failed(err) => return Err(err),
                LoadOutcome::Retry => {
                    // The worker was cancelled; try again unless we were too.
                    ctx.check()?;
                    tracing::debug!(package = %name, "retrying load after worker cancellation");
                }
            }
        }
    }

    fn run_worker(&self, ctx: &Context, loading: &Arc<LoadingPackage>) -> Result<Arc<Package>> {
        let name = loading.location.package_name.clone();
        let _span = tracing::info_span!("package.load", package = %name).entered();

        let mut guard = WorkerGuard {
            loader: self,
            loading,
            completed: false,
        };

        let wctx = ctx.with_loading(name.as_str());
        let result = self
            .frontend
            .parse_package(&wctx, self, &loading.location)
            .and_then(|pkg| finalize_package(&wctx, &self.finalize_env(), pkg));

        match result {
            Ok(pkg) => {
                let pkg = Arc::new(pkg);
                {
                    let mut state = self.state.write();
                    state.loaded.insert(name.clone(), pkg.clone());
                    state.loading.remove(&name);
                }
                guard.complete(LoadOutcome::Loaded(pkg.clone()));
                tracing::debug!("loaded package");
                Ok(pkg)
            }
            Err(err) if err.is_cancellation() && ctx.err().is_some() => {
                self.forget(loading);
                guard.complete(LoadOutcome::Retry);
                Err(err)
            }
            Err(err) => {
                tracing::debug!(error = %err, "package failed to load");
                guard.complete(LoadOutcome::Failed(err.clone()));
                Err(err)
            }
        }
    }

    /// Drop `loading` from the coordinator map, if it is still there.
    fn forget(&self, loading: &Arc<LoadingPackage>) {
        let mut state = self.state.write();
        let name = &loading.location.package_name;
        if state
            .loading
            .get(name)
            .map(|current| Arc::ptr_eq(current, loading))
            .unwrap_or(false)
        {
            state.loading.remove(name);
        }
    }

    /// Record that the caller is about to block on `target`, failing if
    /// that would close a cycle of workers waiting on each other.
    fn block_on(&self, ctx: &Context, target: &PackageName) -> Result<WaitRegistration<'_>> {
        let chain = ctx.loading_chain();
        let Some(me) = chain.last() else {
            return Ok(WaitRegistration {
                loader: self,
                edges: Vec::new(),
            });
        };

        let mut edges: Vec<(String, String)> = chain
            .windows(2)
            .map(|w| (w[0].clone(), w[1].clone()))
            .collect();
        edges.push((me.clone(), target.to_string()));

        let mut waits = self.waits.lock();
        if let Some(path) = waits.path(target.as_str(), me) {
            let mut cycle = vec![me.clone()];
            cycle.extend(path);
            return Err(Error::CycleDetected { path: cycle });
        }
        waits.add(&edges);

        Ok(WaitRegistration { loader: self, edges })
    }
}

impl PackageLoader for Loader {
    fn resolve(&self, ctx: &Context, name: &PackageName) -> Result<Location> {
        self.resolve_name(ctx, name)
    }

    fn load_by_name(&self, ctx: &Context, name: &PackageName) -> Result<Arc<Package>> {
        let location = self.resolve_name(ctx, name)?;
        self.load_package(ctx, location)
    }
}

#[derive(Clone)]
enum LoadOutcome {
    Loaded(Arc<Package>),
    Failed(Error),
    /// The worker was cancelled; waiters should load again
    Retry,
}

/// Coordinates concurrent loads of one package
struct LoadingPackage {
    location: Location,
    state: Mutex<LoadingState>,
}

#[derive(Default)]
struct LoadingState {
    // The first caller gets to load the package.
    waiting: usize,
    waiters: Vec<Sender<LoadOutcome>>,
    result: Option<LoadOutcome>,
}

impl LoadingPackage {
    fn new(location: Location) -> Self {
        LoadingPackage {
            location,
            state: Mutex::new(LoadingState::default()),
        }
    }

    /// Whether the caller is the worker.
    fn claim(&self) -> bool {
        let mut state = self.state.lock();
        let rev = state.waiting;
        state.waiting += 1;
        rev == 0
    }

    fn complete(&self, outcome: LoadOutcome) {
        let waiters = {
            let mut state = self.state.lock();
            state.result = Some(outcome.clone());
            std::mem::take(&mut state.waiters)
        };

        for tx in waiters {
            // Channels hold one value and are written once.
            let _ = tx.try_send(outcome.clone());
        }
    }

    /// Drop every waiter without a result; they observe an unexpected EOF.
    fn abandon(&self) {
        let waiters = std::mem::take(&mut self.state.lock().waiters);
        drop(waiters);
    }

    fn wait(&self, ctx: &Context, loader: &Loader) -> Result<LoadOutcome> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(result) = &state.result {
                return Ok(result.clone());
            }

            let (tx, rx) = channel::bounded(1);
            state.waiters.push(tx);
            rx
        };

        let _registration = loader.block_on(ctx, &self.location.package_name)?;
        let deadline = ctx.deadline_channel();

        select! {
            recv(rx) -> msg => msg.map_err(|_| {
                Error::internal("unexpected eof").at(&self.location.package_name)
            }),
            recv(ctx.done()) -> _ => Err(ctx.err().unwrap_or(Error::Cancelled)),
            recv(deadline) -> _ => Err(Error::DeadlineExceeded),
        }
    }
}

/// Makes sure waiters are released if the worker unwinds.
struct WorkerGuard<'a> {
    loader: &'a Loader,
    loading: &'a Arc<LoadingPackage>,
    completed: bool,
}

impl WorkerGuard<'_> {
    fn complete(&mut self, outcome: LoadOutcome) {
        self.completed = true;
        self.loading.complete(outcome);
    }
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.loader.forget(self.loading);
            self.loading.abandon();
        }
    }
}

/// Which loads are blocked on which, keyed by package name
#[derive(Default)]
struct WaitGraph {
    edges: HashMap<String, Vec<String>>,
}

impl WaitGraph {
    fn add(&mut self, edges: &[(String, String)]) {
        for (from, to) in edges {
            self.edges.entry(from.clone()).or_default().push(to.clone());
        }
    }

    fn remove(&mut self, edges: &[(String, String)]) {
        for (from, to) in edges {
            if let Some(targets) = self.edges.get_mut(from) {
                if let Some(pos) = targets.iter().position(|t| t == to) {
                    targets.swap_remove(pos);
                }
                if targets.is_empty() {
                    self.edges.remove(from);
                }
            }
        }
    }

    /// A path of wait edges from `from` to `to`, both included.
    fn path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut stack = vec![vec![from.to_string()]];
        let mut visited = std::collections::HashSet::new();

        while let Some(path) = stack.pop() {
            let Some(last) = path.last() else { continue };
            if last == to {
                return Some(path);
            }
            if !visited.insert(last.clone()) {
                continue;
            }
            if let Some(targets) = self.edges.get(last) {
                for next in targets {
                    let mut extended = path.clone();
                    extended.push(next.clone());
                    stack.push(extended);
                }
            }
        }

        None
    }
}

struct WaitRegistration<'a> {
    loader: &'a Loader,
    edges: Vec<(String, String)>,
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        if !self.edges.is_empty() {
            self.loader.waits.lock().remove(&self.edges);
        }
    }
}

/// Read-only snapshot of a [`Loader`]
#[derive(Debug, Clone)]
pub struct SealedPackages {
    modules: BTreeMap<String, Arc<Module>>,
    packages: BTreeMap<PackageName, Arc<Package>>,
    rewrites: Vec<ModuleRewrite>,
}

impl SealedPackages {
    /// Modules, sorted by name
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules.values().cloned().collect()
    }

    /// Packages, sorted by name
    pub fn packages(&self) -> Vec<Arc<Package>> {
        self.packages.values().cloned().collect()
    }
}

impl PackageLoader for SealedPackages {
    fn resolve(&self, _ctx: &Context, original: &PackageName) -> Result<Location> {
        let name = rewrite_package(&self.rewrites, original);

        if let Some(pkg) = self.packages.get(&name) {
            return Ok(pkg.location.clone());
        }

        if let Some(module) = self.modules.get(name.as_str()) {
            return Ok(module.make_location("."));
        }

        Err(Error::internal("package not loaded while resolving").at(&name))
    }

    fn load_by_name(&self, _ctx: &Context, original: &PackageName) -> Result<Arc<Package>> {
        let name = rewrite_package(&self.rewrites, original);

        self.packages
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::internal("package not loaded").at(&name))
    }
}
