//! Dependency sealing
//!
//! Sealing computes the transitive closure of a focus package: every node,
//! fragment and (at most one) server it pulls in, ordered deterministically.
//! When the closure holds a server, a copy of it is completed with
//! everything its embedded nodes and fragments contribute.
//!
//! Packages are loaded in parallel, one scoped thread per newly seen name.
//! The first failure cancels the group and is the only error reported.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::framework::{FrameworkRegistry, ServerFrameworkExt};
use crate::loader::PackageLoader;
use crate::module::Location;
use crate::schema::{
    sort_services, Allocation, AllocationInstance, DeployableClass, Facet, Framework, Instantiate, Node,
    NodeKind, Package, PackageList, PackageName, PackageRef, ResourcePack, Server, ServerFragment,
    VolumeKind,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, Scope};

type ServerDepsFn = dyn Fn(Framework) -> Result<Vec<PackageName>> + Send + Sync;

/// Extra dependencies for servers, e.g. development tooling
pub struct SealHelper {
    additional_server_deps: Box<ServerDepsFn>,
}

impl SealHelper {
    pub fn new(f: impl Fn(Framework) -> Result<Vec<PackageName>> + Send + Sync + 'static) -> Self {
        SealHelper {
            additional_server_deps: Box::new(f),
        }
    }

    /// Adds each framework's development packages to its servers.
    pub fn development(frameworks: FrameworkRegistry) -> Self {
        SealHelper::new(move |framework| Ok(frameworks.development_packages(framework)))
    }

    pub fn additional_server_deps(&self, framework: Framework) -> Result<Vec<PackageName>> {
        (self.additional_server_deps)(framework)
    }
}

impl std::fmt::Debug for SealHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealHelper").finish_non_exhaustive()
    }
}

/// The sealed closure of a focus package
#[derive(Debug, Clone)]
pub struct Sealed {
    pub location: Location,
    pub focus_package: PackageName,
    /// The completed server, if the closure holds one
    pub server: Option<Server>,
    /// Nodes, by rank and then name
    pub deps: Vec<Arc<Package>>,
    /// Fragments, by content digest
    pub fragments: Vec<Arc<Package>>,
    /// The server's package as loaded
    pub parsed_package: Option<Arc<Package>>,
    /// Final state of every package visited
    pub states: BTreeMap<PackageName, SealState>,
}

impl Sealed {
    pub fn has_dep(&self, name: &PackageName) -> bool {
        self.deps.iter().any(|dep| dep.package_name() == name)
    }

    pub fn state(&self, name: &PackageName) -> Option<SealState> {
        self.states.get(name).copied()
    }
}

/// Progress of one package within a seal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealState {
    Pending,
    Visiting,
    Done,
    Failed,
}

struct ServerVisit {
    package: Arc<Package>,
    include: Vec<PackageName>,
    ext: ServerFrameworkExt,
}

#[derive(Default)]
struct Closure {
    seen: PackageList,
    states: BTreeMap<PackageName, SealState>,
    packages: HashMap<PackageName, Arc<Package>>,
    edges: BTreeMap<PackageName, Vec<PackageName>>,
    nodes: Vec<Arc<Package>>,
    fragments: Vec<Arc<Package>>,
    server: Option<ServerVisit>,
}

struct Sealer<'a> {
    loader: &'a dyn PackageLoader,
    frameworks: &'a FrameworkRegistry,
    helper: Option<&'a SealHelper>,
    gctx: Context,
    closure: Mutex<Closure>,
    first_error: Mutex<Option<Error>>,
}

/// Seal the dependency graph of `focus`.
pub fn seal(
    ctx: &Context,
    loader: &dyn PackageLoader,
    frameworks: &FrameworkRegistry,
    focus: &PackageName,
    helper: Option<&SealHelper>,
) -> Result<Sealed> {
    let _span = tracing::info_span!("seal", focus = %focus).entered();

    let sealer = Sealer {
        loader,
        frameworks,
        helper,
        gctx: ctx.child(),
        closure: Mutex::new(Closure::default()),
        first_error: Mutex::new(None),
    };

    thread::scope(|scope| sealer.schedule(scope, vec![focus.clone()]));
    sealer.gctx.cancel();

    let first_error = sealer.first_error.lock().take();
    if let Some(err) = first_error {
        return Err(err);
    }
    ctx.check()?;

    let closure = sealer.closure.into_inner();
    finish(ctx, loader, frameworks, focus, closure)
}

impl<'a> Sealer<'a> {
    fn schedule<'scope>(&'scope self, scope: &'scope Scope<'scope, '_>, names: Vec<PackageName>) {
        let todo: Vec<PackageName> = {
            let mut closure = self.closure.lock();
            names
                .into_iter()
                .filter(|name| {
                    let added = closure.seen.add(name.clone());
                    if added {
                        closure.states.insert(name.clone(), SealState::Pending);
                    }
                    added
                })
                .collect()
        };

        for name in todo {
            scope.spawn(move || self.visit(scope, name));
        }
    }

    fn visit<'scope>(&'scope self, scope: &'scope Scope<'scope, '_>, name: PackageName) {
        self.set_state(&name, SealState::Visiting);

        let result = self.gctx.check().and_then(|_| self.visit_package(scope, &name));
        match result {
            Ok(()) => self.set_state(&name, SealState::Done),
            Err(err) => {
                self.set_state(&name, SealState::Failed);
                self.fail(err);
            }
        }
    }

    fn visit_package<'scope>(&'scope self, scope: &'scope Scope<'scope, '_>, name: &PackageName) -> Result<()> {
        let pkg = self.loader.load_by_name(&self.gctx, name)?;
        self.closure.lock().packages.insert(name.clone(), pkg.clone());

        let next = match &pkg.facet {
            Facet::Server(server) => {
                let ext = self
                    .frameworks
                    .pre_parse_server(&self.gctx, server.framework, &pkg.location)?;

                let mut include = ext.include.clone();
                if let Some(helper) = self.helper {
                    include.extend(helper.additional_server_deps(server.framework)?);
                }
                include.extend(server.imported_packages());
                let include: Vec<PackageName> = include.into_iter().collect::<PackageList>().into_vec();

                let mut closure = self.closure.lock();
                if let Some(existing) = &closure.server {
                    return Err(Error::internal(format!(
                        "server already defined ({})",
                        existing.package.package_name()
                    ))
                    .at(name));
                }
                closure.edges.insert(name.clone(), include.clone());
                closure.server = Some(ServerVisit {
                    package: pkg.clone(),
                    include: include.clone(),
                    ext,
                });
                include
            }

            Facet::Node(node) => {
                let imports = node.imported_packages();
                let mut closure = self.closure.lock();
                closure.edges.insert(name.clone(), imports.clone());
                closure.nodes.push(pkg.clone());
                imports
            }

            Facet::Fragment(fragment) => {
                let mut closure = self.closure.lock();
                closure.edges.insert(name.clone(), fragment.extensions.clone());
                closure.fragments.push(pkg.clone());
                fragment.extensions.clone()
            }

            Facet::None if pkg.binaries.is_empty() && pkg.tests.is_empty() => {
                return Err(Error::bad_input("no server, and no node?").at(name));
            }

            Facet::None => Vec::new(),
        };

        self.schedule(scope, next);
        Ok(())
    }

    fn set_state(&self, name: &PackageName, state: SealState) {
        tracing::trace!(package = %name, ?state, "seal state");
        self.closure.lock().states.insert(name.clone(), state);
    }

    fn fail(&self, err: Error) {
        {
            let mut first = self.first_error.lock();
            if first.is_none() {
                tracing::debug!(error = %err, "seal failed");
                *first = Some(err);
            }
        }
        self.gctx.cancel();
    }
}

fn finish(
    ctx: &Context,
    loader: &dyn PackageLoader,
    frameworks: &FrameworkRegistry,
    focus: &PackageName,
    closure: Closure,
) -> Result<Sealed> {
    if let Some(path) = find_cycle(&closure.edges) {
        return Err(Error::CycleDetected {
            path: path.iter().map(|p| p.to_string()).collect(),
        });
    }

    let location = closure
        .packages
        .get(focus)
        .map(|p| p.location.clone())
        .ok_or_else(|| Error::internal("focus package was not loaded").at(focus))?;

    let mut flattened = PackageList::new();
    like_topo_sort(&closure.edges, closure.edges.get(focus).map(Vec::as_slice).unwrap_or(&[]), &mut flattened);
    let rank = |name: &PackageName| flattened.position(name).map(|p| p + 1).unwrap_or(usize::MAX);

    let mut deps = closure.nodes;
    deps.sort_by(|a, b| {
        rank(a.package_name())
            .cmp(&rank(b.package_name()))
            .then_with(|| a.package_name().cmp(b.package_name()))
    });

    let mut fragments: Vec<(String, Arc<Package>)> = closure
        .fragments
        .into_iter()
        .map(|pkg| fragment_digest(&pkg).map(|digest| (digest, pkg)))
        .collect::<Result<_>>()?;
    fragments.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.package_name().cmp(b.1.package_name())));
    let fragments: Vec<Arc<Package>> = fragments.into_iter().map(|(_, pkg)| pkg).collect();

    let mut sealed = Sealed {
        location,
        focus_package: focus.clone(),
        server: None,
        deps,
        fragments,
        parsed_package: None,
        states: closure.states,
    };

    let Some(visit) = closure.server else {
        return Ok(sealed);
    };

    let server = complete_server(ctx, loader, &closure.edges, &visit, &sealed)?;
    let framework = server.framework;
    sealed.server = Some(server);
    sealed.parsed_package = Some(visit.package);

    if let Some(handler) = frameworks.get(framework) {
        handler.post_parse_server(ctx, &mut sealed)?;
    }

    Ok(sealed)
}

fn fragment_digest(pkg: &Package) -> Result<String> {
    let fragment = pkg.fragment().cloned().unwrap_or_default();
    let encoded = serde_json::to_vec(&fragment)
        .map_err(|e| Error::internal(format!("failed to serialize fragment: {}", e)).at(pkg.package_name()))?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// A cycle in `edges`, as a path that starts and ends at the same package.
fn find_cycle(edges: &BTreeMap<PackageName, Vec<PackageName>>) -> Option<Vec<PackageName>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Active,
        Finished,
    }

    fn walk(
        name: &PackageName,
        edges: &BTreeMap<PackageName, Vec<PackageName>>,
        marks: &mut HashMap<PackageName, Mark>,
        stack: &mut Vec<PackageName>,
    ) -> Option<Vec<PackageName>> {
        match marks.get(name) {
            Some(Mark::Finished) => return None,
            Some(Mark::Active) => {
                let start = stack.iter().position(|p| p == name).unwrap_or(0);
                let mut path = stack[start..].to_vec();
                path.push(name.clone());
                return Some(path);
            }
            None => {}
        }

        marks.insert(name.clone(), Mark::Active);
        stack.push(name.clone());

        for next in edges.get(name).into_iter().flatten() {
            if let Some(path) = walk(next, edges, marks, stack) {
                return Some(path);
            }
        }

        stack.pop();
        marks.insert(name.clone(), Mark::Finished);
        None
    }

    let mut marks = HashMap::new();
    for name in edges.keys() {
        let mut stack = Vec::new();
        if let Some(path) = walk(name, edges, &mut marks, &mut stack) {
            return Some(path);
        }
    }
    None
}

/// Depth-first post-order flattening: dependencies before dependents.
fn like_topo_sort(edges: &BTreeMap<PackageName, Vec<PackageName>>, pkgs: &[PackageName], out: &mut PackageList) {
    for pkg in pkgs {
        if out.contains(pkg) {
            continue;
        }
        like_topo_sort(edges, edges.get(pkg).map(Vec::as_slice).unwrap_or(&[]), out);
        out.add(pkg.clone());
    }
}

fn complete_server(
    ctx: &Context,
    loader: &dyn PackageLoader,
    edges: &BTreeMap<PackageName, Vec<PackageName>>,
    visit: &ServerVisit,
    sealed: &Sealed,
) -> Result<Server> {
    let server_pkg = &visit.package;
    let Some(original) = server_pkg.server() else {
        return Err(Error::internal("expected a server").at(server_pkg.package_name()));
    };
    let mut server = original.clone();
    let loc = server_pkg.package_name().clone();

    if let Some(ext) = &visit.ext.framework_specific {
        server.framework_ext.push(ext.clone());
    }

    for fragment_pkg in &sealed.fragments {
        if let Some(fragment) = fragment_pkg.fragment() {
            merge_fragment(&mut server.self_fragment, fragment, fragment_pkg.package_name())?;
        }
    }

    let mut resource_refs: BTreeMap<String, PackageRef> = BTreeMap::new();
    if let Some(pack) = &server.self_fragment.resource_pack {
        for reference in &pack.resource_refs {
            resource_refs.insert(reference.canonical(), reference.clone());
        }
    }

    for dep in &sealed.deps {
        let Some(node) = dep.node() else { continue };

        if node.kind == NodeKind::Service && node.service_framework != server.framework {
            return Err(Error::bad_input(format!(
                "the server {:?} can only embed services of its framework {}, can't embed service {:?} implemented in {}",
                server.package_name.as_str(),
                server.framework,
                node.package_name.as_str(),
                node.service_framework
            ))
            .at(dep.package_name()));
        }

        for volume in &node.volumes {
            if volume.owner != node.package_name {
                return Err(Error::bad_input(format!(
                    "volume: didn't expect owner to be {:?}",
                    volume.owner.as_str()
                ))
                .at(&node.package_name));
            }
            server.self_fragment.volumes.push(volume.clone());
        }

        for mount in &node.mounts {
            if mount.owner != node.package_name {
                return Err(Error::bad_input(format!(
                    "mount: didn't expect owner to be {:?}",
                    mount.owner.as_str()
                ))
                .at(&node.package_name));
            }
            server.self_fragment.main_container.mounts.push(mount.clone());
        }

        if let Some(requirement) = &node.environment_requirement {
            let mut requirement = requirement.clone();
            requirement.package = node.package_name.clone();
            server.environment_requirements.push(requirement);
        }

        if let Some(pack) = &node.resource_pack {
            server
                .self_fragment
                .resource_pack
                .get_or_insert_with(ResourcePack::default)
                .instances
                .extend(pack.instances.iter().cloned());

            for reference in &pack.resource_refs {
                resource_refs.insert(reference.canonical(), reference.clone());
            }
        }
    }

    if !resource_refs.is_empty() {
        server
            .self_fragment
            .resource_pack
            .get_or_insert_with(ResourcePack::default)
            .resource_refs = resource_refs.into_values().collect();
    }

    validate_volumes(&server).map_err(|e| e.at(&loc))?;

    let mut sorted = PackageList::new();
    like_topo_sort(edges, &visit.include, &mut sorted);
    server.imports = sorted.into_vec();

    let mut allocator = DepVisitor::default();
    for dep in &sealed.deps {
        if let Some(node) = dep.node() {
            allocator.visit(ctx, loader, &mut server.allocation, node, "")?;
        }
    }

    Ok(server)
}

fn merge_fragment(target: &mut ServerFragment, fragment: &ServerFragment, owner: &PackageName) -> Result<()> {
    for volume in &fragment.volumes {
        if &volume.owner != owner {
            return Err(Error::bad_input(format!(
                "volume: didn't expect owner to be {:?}",
                volume.owner.as_str()
            ))
            .at(owner));
        }
    }

    for container in fragment.containers() {
        for mount in &container.mounts {
            if &mount.owner != owner {
                return Err(Error::bad_input(format!(
                    "mount: didn't expect owner to be {:?}",
                    mount.owner.as_str()
                ))
                .at(owner));
            }
        }
    }

    if fragment.main_container.binary.is_some() {
        if target.main_container.binary.is_some() {
            return Err(Error::bad_input("main container binary is already set").at(owner));
        }
        target.main_container.binary = fragment.main_container.binary.clone();
    }

    target.services.extend(fragment.services.iter().cloned());
    target.ingress.extend(fragment.ingress.iter().cloned());
    target.volumes.extend(fragment.volumes.iter().cloned());
    target.main_container.args.extend(fragment.main_container.args.iter().cloned());
    target.main_container.env.extend(fragment.main_container.env.iter().cloned());
    target.main_container.mounts.extend(fragment.main_container.mounts.iter().cloned());
    target.sidecars.extend(fragment.sidecars.iter().cloned());
    target.init_containers.extend(fragment.init_containers.iter().cloned());

    if let Some(pack) = &fragment.resource_pack {
        let merged = target.resource_pack.get_or_insert_with(ResourcePack::default);
        merged.resource_refs.extend(pack.resource_refs.iter().cloned());
        merged.instances.extend(pack.instances.iter().cloned());
    }

    sort_services(&mut target.services);
    sort_services(&mut target.ingress);

    Ok(())
}

fn validate_volumes(server: &Server) -> Result<()> {
    let fragment = &server.self_fragment;

    let mut names = std::collections::HashSet::new();
    for volume in &fragment.volumes {
        if !names.insert(volume.name.as_str()) {
            return Err(Error::bad_input(format!("volume {:?} is defined multiple times", volume.name)));
        }
    }

    let mut workspace_sync_mounts = 0;
    for container in fragment.containers() {
        for mount in &container.mounts {
            let volume = fragment
                .volumes
                .iter()
                .find(|v| v.owner == mount.volume_ref.package_name && v.name == mount.volume_ref.name)
                .ok_or_else(|| Error::bad_input(format!("volume {:?} does not exist", mount.volume_ref.canonical())))?;

            if volume.kind == VolumeKind::WorkspaceSync {
                workspace_sync_mounts += 1;
            }
        }
    }

    if workspace_sync_mounts > 1 {
        return Err(Error::bad_input("only one workspace sync mount is allowed per server"));
    }

    let persistent = fragment.volumes.iter().any(|v| v.kind == VolumeKind::Persistent);
    if persistent && server.deployable_class != DeployableClass::Stateful {
        return Err(Error::bad_input(format!(
            "{}: servers that use persistent storage are required to be of class {:?}",
            server.name,
            DeployableClass::Stateful.to_string()
        )));
    }

    Ok(())
}

/// Assigns allocation names to instantiated packages, depth first.
#[derive(Default)]
struct DepVisitor {
    alloc: usize,
}

impl DepVisitor {
    fn alloc_name(&mut self, parent: &str) -> String {
        let n = self.alloc;
        self.alloc += 1;
        if parent.is_empty() {
            n.to_string()
        } else {
            format!("{}.{}", parent, n)
        }
    }

    fn visit(
        &mut self,
        ctx: &Context,
        loader: &dyn PackageLoader,
        allocs: &mut Vec<Allocation>,
        node: &Node,
        parent: &str,
    ) -> Result<()> {
        if node.instantiate.is_empty() {
            return Ok(());
        }

        let mut deps = PackageList::new();
        let mut per_pkg: HashMap<PackageName, Vec<Instantiate>> = HashMap::new();
        for instantiate in &node.instantiate {
            // Builtin constructors allocate nothing.
            if let Some(pkg) = &instantiate.package_name {
                deps.add(pkg.clone());
                per_pkg.entry(pkg.clone()).or_default().push(instantiate.clone());
            }
        }

        let mut alloc = Allocation::default();
        for pkg in deps.iter() {
            let dep = loader.load_by_name(ctx, pkg)?;

            let mut instance = AllocationInstance {
                owner: node.package_name.clone(),
                package_name: pkg.clone(),
                instantiated: per_pkg.remove(pkg).unwrap_or_default(),
                alloc_name: self.alloc_name(parent),
                downstream: Vec::new(),
            };

            if let Some(dep_node) = dep.node() {
                let name = instance.alloc_name.clone();
                self.visit(ctx, loader, &mut instance.downstream, dep_node, &name)?;
            }

            alloc.instances.push(instance);
        }

        allocs.push(alloc);
        Ok(())
    }
}
