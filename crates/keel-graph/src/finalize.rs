//! Package finalization
//!
//! Runs once per package, right after the frontend parsed it and before it
//! is published by the loader. Validates the package, stamps names, applies
//! integrations, derives binary defaults and resolves resources.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::framework::{FrameworkRegistry, IntegrationRegistry};
use crate::loader::PackageLoader;
use crate::resources::resolve_resources;
use crate::schema::{
    sort_services, BuildPlan, EnvValue, EnvVar, Facet, NodeKind, Package, PackageName, ResourceInstance,
    TypeRegistry,
};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

static SERVER_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-z]{16,32}$").expect("valid server id regex"));

/// Length of generated server ids
const STABLE_ID_LEN: usize = 16;

/// What finalization may consult
pub struct FinalizeEnv<'a> {
    pub loader: &'a dyn PackageLoader,
    pub frameworks: &'a FrameworkRegistry,
    pub integrations: &'a IntegrationRegistry,
    pub types: &'a TypeRegistry,
}

/// Validate and complete a freshly parsed package.
pub fn finalize_package(ctx: &Context, env: &FinalizeEnv<'_>, mut pkg: Package) -> Result<Package> {
    validate_package(&pkg)?;

    match &pkg.facet {
        Facet::Server(_) => transform_server(&mut pkg)?,
        Facet::Node(_) => transform_node(&mut pkg)?,
        Facet::Fragment(_) | Facet::None => {}
    }

    if let Some(kind) = pkg.integration.as_ref().map(|i| i.kind.clone()) {
        let handler = env.integrations.get(&kind).cloned().ok_or_else(|| {
            Error::bad_input(format!("unknown integration kind {:?}", kind)).at(pkg.package_name())
        })?;
        handler.apply(ctx, env, &mut pkg)?;
    }

    transform_binaries(&mut pkg);
    resolve_resources(ctx, env, &mut pkg)?;
    fixup_environment(ctx, env, &mut pkg)?;

    Ok(pkg)
}

/// Stable id for a server, derived from its package name.
pub fn stable_server_id(package_name: &PackageName) -> String {
    let digest = hex::encode(Sha256::digest(package_name.as_str().as_bytes()));
    digest[..STABLE_ID_LEN].to_string()
}

fn validate_package(pkg: &Package) -> Result<()> {
    let mut names = HashSet::new();
    for binary in &pkg.binaries {
        if !names.insert(binary.name.as_str()) {
            return Err(
                Error::bad_input(format!("duplicate binary name {:?}", binary.name)).at(pkg.package_name())
            );
        }
    }
    Ok(())
}

fn transform_server(pkg: &mut Package) -> Result<()> {
    let package_name = pkg.location.package_name.clone();
    let module_name = pkg.location.module_name().to_string();

    let Facet::Server(server) = &mut pkg.facet else {
        return Ok(());
    };

    if server.name.is_empty() {
        return Err(Error::bad_input("server name is required").at(&package_name));
    }

    if server.id.is_empty() {
        server.id = stable_server_id(&package_name);
    }

    if !SERVER_ID.is_match(&server.id) {
        return Err(Error::bad_input(format!(
            "invalid server id {:?}, expected 16 to 32 lowercase letters or digits",
            server.id
        ))
        .at(&package_name));
    }

    server.package_name = package_name;
    server.module_name = module_name;
    server.user_imports = server.imports.clone();

    sort_services(&mut server.self_fragment.services);
    sort_services(&mut server.self_fragment.ingress);

    Ok(())
}

fn transform_node(pkg: &mut Package) -> Result<()> {
    let package_name = pkg.location.package_name.clone();

    let Facet::Node(node) = &mut pkg.facet else {
        return Ok(());
    };

    if node.kind == NodeKind::Extension && (!node.exported_services.is_empty() || !node.exported_http.is_empty()) {
        return Err(Error::bad_input("extensions can't export services or http handlers").at(&package_name));
    }

    for instantiate in &node.instantiate {
        if let Some(dep) = &instantiate.package_name {
            if dep != &package_name && !node.imports.contains(dep) {
                node.imports.push(dep.clone());
            }
        }
    }

    node.package_name = package_name;
    Ok(())
}

fn transform_binaries(pkg: &mut Package) {
    let package_name = pkg.location.package_name.clone();

    for binary in &mut pkg.binaries {
        binary.package_name = package_name.clone();

        if binary.command.is_empty() {
            binary.command = match &binary.build_plan {
                Some(BuildPlan::Go { .. }) => vec![format!("/{}", binary.name)],
                Some(BuildPlan::Nodejs { entrypoint }) => vec!["node".to_string(), entrypoint.clone()],
                // The image's entrypoint applies.
                Some(BuildPlan::Dockerfile { .. }) | Some(BuildPlan::Image { .. }) | None => Vec::new(),
            };
        }
    }
}

fn fixup_environment(ctx: &Context, env: &FinalizeEnv<'_>, pkg: &mut Package) -> Result<()> {
    let owner = pkg.location.package_name.clone();
    let resources = pkg.resources.clone();
    let mut errors = Vec::new();

    let mut visit = |vars: &mut Vec<EnvVar>| {
        for var in vars.iter_mut() {
            if let Err(err) = fixup_env_var(ctx, env, &owner, &resources, var) {
                errors.push(err);
            }
        }
    };

    for binary in &mut pkg.binaries {
        visit(&mut binary.env);
    }

    match &mut pkg.facet {
        Facet::Server(server) => {
            for container in server.self_fragment.containers_mut() {
                visit(&mut container.env);
            }
        }
        Facet::Fragment(fragment) => {
            for container in fragment.containers_mut() {
                visit(&mut container.env);
            }
        }
        Facet::Node(_) | Facet::None => {}
    }

    Error::from_errors(errors)
}

fn fixup_env_var(
    ctx: &Context,
    env: &FinalizeEnv<'_>,
    owner: &PackageName,
    resources: &[ResourceInstance],
    var: &mut EnvVar,
) -> Result<()> {
    let var_name = var.name.clone();

    match &mut var.value {
        EnvValue::FromResourceField {
            resource,
            field_selector,
        } => {
            let instance = if &resource.package_name == owner {
                resources.iter().find(|r| r.reference.name == resource.name).cloned()
            } else {
                env.loader
                    .load_by_name(ctx, &resource.package_name)?
                    .lookup_resource_instance(&resource.name)
                    .cloned()
            };

            let instance = instance.ok_or_else(|| {
                Error::bad_input(format!("env var {:?} references unknown resource {}", var_name, resource))
                    .at(owner)
            })?;

            *field_selector = instance
                .spec
                .class
                .instance_type
                .canonical_selector(field_selector)
                .map_err(|e| Error::bad_input(format!("env var {:?}: {}", var_name, e)).at(owner))?;
        }

        EnvValue::FromSecret(secret) => {
            if &secret.package_name != owner {
                env.loader.ensure(ctx, &secret.package_name)?;
            }
        }

        EnvValue::FromServerEndpoint(server) => {
            if server != owner {
                env.loader.ensure(ctx, server)?;
            }
        }

        EnvValue::Literal(_) => {}
    }

    Ok(())
}
