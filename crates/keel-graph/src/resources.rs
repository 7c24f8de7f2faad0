//! Resource graph resolution
//!
//! Runs as part of finalization. Classes are resolved first, then providers
//! (which may reference classes of the same package), then instances (which
//! may reference providers and instances of the same package). References
//! into the package being finalized are always resolved from the package
//! itself: going through the loader would wait on our own load.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::finalize::FinalizeEnv;
use crate::intent::{allocate_intent, allocate_package_ref, ParseContext};
use crate::schema::{
    is_runtime_resource, is_secret_resource, is_server_resource, scoped_id, ExpectedResourceInstance,
    Package, PackageName, PackageRef, ResourceClass, ResourceClassSpec, ResourceInstance,
    ResourceInstanceSpec, ResourcePack, ResourceProvider, ResourceProviderSpec, ResourceSpec,
    TypedValue, UserType, PACKAGE_REF_TYPE, RUNTIME_PACKAGE,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Resolve the classes, providers and instances `pkg` declares.
pub(crate) fn resolve_resources(ctx: &Context, env: &FinalizeEnv<'_>, pkg: &mut Package) -> Result<()> {
    let owner = pkg.package_name().clone();
    for spec in &mut pkg.resource_class_specs {
        spec.package_name = owner.clone();
    }
    for spec in &mut pkg.resource_provider_specs {
        spec.package_name = owner.clone();
    }
    for spec in &mut pkg.resource_instance_specs {
        if spec.package_name.is_empty() {
            spec.package_name = owner.clone();
        }
    }

    pkg.resource_classes = resolve_classes(env, pkg)?;
    pkg.resource_providers = resolve_providers(ctx, env, pkg)?;

    let pack = ResourcePack {
        resource_refs: Vec::new(),
        instances: pkg.resource_instance_specs.clone(),
    };
    pkg.resources = load_resources(ctx, env, pkg, "", &pack)?;

    Ok(())
}

fn resolve_classes(env: &FinalizeEnv<'_>, pkg: &Package) -> Result<Vec<ResourceClass>> {
    let mut classes: Vec<ResourceClass> = Vec::new();

    for spec in &pkg.resource_class_specs {
        if classes.iter().any(|c| c.spec.name == spec.name) {
            return Err(
                Error::bad_input(format!("resource class {:?} is defined multiple times", spec.name))
                    .at(pkg.package_name()),
            );
        }

        let intent_type = UserType::resolve(&spec.intent_type, &pkg.types, env.types)
            .map_err(|e| e.at(pkg.package_name()))?;
        let instance_type = UserType::resolve(&spec.instance_type, &pkg.types, env.types)
            .map_err(|e| e.at(pkg.package_name()))?;

        classes.push(ResourceClass {
            reference: PackageRef::new(pkg.package_name().clone(), spec.name.clone()),
            default_provider: spec.default_provider.clone(),
            spec: spec.clone(),
            intent_type,
            instance_type,
        });
    }

    Ok(classes)
}

/// Primitive classes are known without loading anything; their intent is a
/// reference to the server or secret they stand for.
fn runtime_class(class: &PackageRef, env: &FinalizeEnv<'_>) -> Result<ResourceClass> {
    if !is_server_resource(class) && !is_secret_resource(class) {
        return Err(Error::bad_input(format!("{}: no such runtime resource class", class)));
    }

    let reference_type = UserType::resolve(PACKAGE_REF_TYPE, &[], env.types)?;

    Ok(ResourceClass {
        reference: PackageRef::new(RUNTIME_PACKAGE, class.name.clone()),
        spec: ResourceClassSpec {
            name: class.name.clone(),
            package_name: PackageName::new(RUNTIME_PACKAGE),
            intent_type: PACKAGE_REF_TYPE.to_string(),
            instance_type: PACKAGE_REF_TYPE.to_string(),
            default_provider: None,
            description: String::new(),
        },
        default_provider: None,
        intent_type: reference_type.clone(),
        instance_type: reference_type,
    })
}

fn lookup_class(ctx: &Context, env: &FinalizeEnv<'_>, pkg: &Package, class: &PackageRef) -> Result<ResourceClass> {
    if is_runtime_resource(class) {
        return runtime_class(class, env);
    }

    let found = if &class.package_name == pkg.package_name() {
        pkg.lookup_resource_class(&class.name).cloned()
    } else {
        env.loader
            .load_by_name(ctx, &class.package_name)?
            .lookup_resource_class(&class.name)
            .cloned()
    };

    found.ok_or_else(|| Error::bad_input(format!("{}: no such resource class", class)).at(pkg.package_name()))
}

fn lookup_provider(
    ctx: &Context,
    env: &FinalizeEnv<'_>,
    pkg: &Package,
    provider: &PackageName,
    class: &PackageRef,
) -> Result<ResourceProvider> {
    let found = if provider == pkg.package_name() {
        pkg.lookup_resource_provider(class).cloned()
    } else {
        env.loader
            .load_by_name(ctx, provider)?
            .lookup_resource_provider(class)
            .cloned()
    };

    found.ok_or_else(|| {
        Error::bad_input(format!(
            "package {:?} is not a provider for resource class {:?}",
            provider.as_str(),
            class.canonical()
        ))
    })
}

/// Load `package` unless it is the one being finalized.
fn ensure_package(ctx: &Context, env: &FinalizeEnv<'_>, pkg: &Package, package: &PackageName) -> Result<()> {
    if package == pkg.package_name() {
        return Ok(());
    }
    env.loader.ensure(ctx, package)
}

fn ensure_binary(ctx: &Context, env: &FinalizeEnv<'_>, pkg: &Package, binary: &PackageRef) -> Result<()> {
    if &binary.package_name == pkg.package_name() {
        return pkg.lookup_binary(&binary.name).map(|_| ());
    }

    let binary_pkg = env.loader.load_by_name(ctx, &binary.package_name)?;
    binary_pkg.lookup_binary(&binary.name).map(|_| ())
}

fn resolve_providers(ctx: &Context, env: &FinalizeEnv<'_>, pkg: &Package) -> Result<Vec<ResourceProvider>> {
    let mut providers = Vec::new();
    let mut errors = Vec::new();

    for spec in &pkg.resource_provider_specs {
        match resolve_provider(ctx, env, pkg, spec) {
            Ok(provider) => providers.push(provider),
            Err(err) => errors.push(err),
        }
    }

    Error::from_errors(errors)?;
    Ok(providers)
}

fn resolve_provider(
    ctx: &Context,
    env: &FinalizeEnv<'_>,
    pkg: &Package,
    spec: &ResourceProviderSpec,
) -> Result<ResourceProvider> {
    let owner = pkg.package_name();
    let provides = spec.provides_class.canonical();
    let mut errors = Vec::new();

    match &spec.initialized_with {
        Some(invocation) => {
            if let Err(err) = ensure_binary(ctx, env, pkg, &invocation.binary) {
                errors.push(err);
            }
        }
        None => errors.push(
            Error::bad_input(format!("provider for {:?} is missing initialized_with", provides)).at(owner),
        ),
    }

    let class = match lookup_class(ctx, env, pkg, &spec.provides_class) {
        Ok(class) => Some(class),
        Err(err) => {
            errors.push(err);
            None
        }
    };

    let mut inputs = Vec::new();
    let mut input_names = HashSet::new();
    for input in &spec.inputs {
        if !input_names.insert(input.name.as_str()) {
            errors.push(
                Error::bad_input(format!(
                    "provider for {:?}: input {:?} is defined multiple times",
                    provides, input.name
                ))
                .at(owner),
            );
            continue;
        }

        match lookup_class(ctx, env, pkg, &input.class) {
            Ok(class) => inputs.push(ExpectedResourceInstance {
                name: input.name.clone(),
                class,
                default_resource: input.default_resource.clone(),
            }),
            Err(err) => errors.push(err),
        }
    }

    let provider_id = format!("{}:{}", owner, provides);

    let mut resources = Vec::new();
    if let Some(pack) = &spec.resource_pack {
        match load_resources(ctx, env, pkg, &provider_id, pack) {
            Ok(loaded) => resources = loaded,
            Err(err) => errors.push(err),
        }
    }

    for resource in &resources {
        if input_names.contains(resource.reference.name.as_str()) {
            errors.push(
                Error::bad_input(format!(
                    "provider for {:?}: resource {:?} collides with an input of the same name",
                    provides, resource.reference.name
                ))
                .at(owner),
            );
        }
    }

    let intent_type = match (&spec.intent_type, &class) {
        (Some(name), _) => match UserType::resolve(name, &pkg.types, env.types) {
            Ok(ut) => Some(ut),
            Err(err) => {
                errors.push(err.at(owner));
                None
            }
        },
        (None, Some(class)) => Some(class.intent_type.clone()),
        (None, None) => None,
    };

    Error::from_errors(errors)?;

    let (Some(class), Some(intent_type)) = (class, intent_type) else {
        return Err(Error::internal(format!("provider for {:?} was not resolved", provides)).at(owner));
    };

    Ok(ResourceProvider {
        spec: spec.clone(),
        provider_id,
        class,
        intent_type,
        resources,
        inputs,
    })
}

/// Resolve a pack: references to resources declared elsewhere, then inline
/// instances.
pub(crate) fn load_resources(
    ctx: &Context,
    env: &FinalizeEnv<'_>,
    pkg: &Package,
    parent_id: &str,
    pack: &ResourcePack,
) -> Result<Vec<ResourceInstance>> {
    let mut resources = Vec::new();
    let mut errors = Vec::new();

    for reference in &pack.resource_refs {
        let loaded = if &reference.package_name == pkg.package_name() {
            match pkg.resource_instance_specs.iter().find(|r| r.name == reference.name) {
                Some(spec) => load_instance(ctx, env, pkg, parent_id, spec, &[]).map(Some),
                None => Ok(None),
            }
        } else {
            env.loader
                .load_by_name(ctx, &reference.package_name)
                .map(|other| other.lookup_resource_instance(&reference.name).cloned())
        };

        match loaded {
            Ok(Some(instance)) => resources.push(instance),
            Ok(None) => errors.push(Error::bad_input(format!("{}: no such resource", reference))),
            Err(err) => errors.push(err),
        }
    }

    for spec in &pack.instances {
        match load_instance(ctx, env, pkg, parent_id, spec, &[]) {
            Ok(instance) => resources.push(instance),
            Err(err) => errors.push(err),
        }
    }

    Error::from_errors(errors)?;
    Ok(resources)
}

fn load_instance(
    ctx: &Context,
    env: &FinalizeEnv<'_>,
    pkg: &Package,
    parent_id: &str,
    spec: &ResourceInstanceSpec,
    visiting: &[String],
) -> Result<ResourceInstance> {
    let mut source = spec.clone();
    if source.package_name.is_empty() {
        source.package_name = pkg.package_name().clone();
    }
    let name = PackageRef::new(source.package_name.clone(), source.name.clone());
    let owner = pkg.package_name();

    if source.intent.is_some() && source.intent_from.is_some() {
        return Err(Error::bad_input(format!(
            "resource instance {:?} can't specify both intent and intent_from",
            source.name
        ))
        .at(owner));
    }

    if let Some(invocation) = &source.intent_from {
        ensure_package(ctx, env, pkg, &invocation.binary.package_name)?;
    }

    let class = lookup_class(ctx, env, pkg, &source.class)?;

    if is_runtime_resource(&class.reference) {
        return load_primitive(ctx, env, pkg, parent_id, source, name, class);
    }

    let provider_name = source
        .provider
        .clone()
        .or_else(|| class.default_provider.clone())
        .ok_or_else(|| Error::bad_input(format!("missing provider for instance {:?}", source.name)).at(owner))?;

    let provider =
        lookup_provider(ctx, env, pkg, &provider_name, &source.class).map_err(|e| e.at(&name))?;
    let intent_type = provider.intent_type.clone();

    let intent = match &source.intent {
        Some(raw) => Some(
            parse_intent(ctx, env, pkg, &source.package_name, &intent_type, raw).map_err(|e| {
                Error::bad_input(format!("failed to parse intent {:?}: {}", source.name, e)).at(owner)
            })?,
        ),
        None => None,
    };

    let mut supplied: BTreeMap<&str, &PackageRef> = source
        .inputs
        .iter()
        .map(|input| (input.name.as_str(), &input.resource_ref))
        .collect();

    let mut visiting = visiting.to_vec();
    visiting.push(source.name.clone());

    let mut inputs = Vec::new();
    let mut errors = Vec::new();

    for expected in &provider.inputs {
        let resource_ref = match supplied.remove(expected.name.as_str()) {
            Some(reference) => reference.clone(),
            None => match &expected.default_resource {
                Some(reference) => reference.clone(),
                None => {
                    errors.push(Error::bad_input(format!("resource input for {:?} is missing", expected.name)));
                    continue;
                }
            },
        };

        let instance = if &resource_ref.package_name == owner {
            if visiting.contains(&resource_ref.name) {
                errors.push(Error::bad_input(format!(
                    "resource {:?} depends on itself through {:?}",
                    resource_ref.name, expected.name
                )));
                continue;
            }

            let Some(dep_spec) = pkg.resource_instance_specs.iter().find(|r| r.name == resource_ref.name) else {
                errors.push(Error::bad_input(format!(
                    "resource {:?} refers to non-existing resource {:?}",
                    expected.name,
                    resource_ref.canonical()
                )));
                continue;
            };

            match load_instance(ctx, env, pkg, parent_id, dep_spec, &visiting) {
                Ok(instance) => instance,
                Err(err) => {
                    errors.push(Error::bad_input(format!("resource {:?} failed to load: {}", expected.name, err)));
                    continue;
                }
            }
        } else {
            let other = match env.loader.load_by_name(ctx, &resource_ref.package_name) {
                Ok(other) => other,
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    errors.push(Error::bad_input(format!(
                        "resource {:?} failed to load package: {}",
                        expected.name, err
                    )));
                    continue;
                }
            };

            match other.lookup_resource_instance(&resource_ref.name) {
                Some(instance) => instance.clone(),
                None => {
                    errors.push(Error::bad_input(format!(
                        "resource {:?} refers to non-existing resource {:?}",
                        expected.name,
                        resource_ref.canonical()
                    )));
                    continue;
                }
            }
        };

        if instance.spec.class.reference != expected.class.reference {
            errors.push(Error::bad_input(format!(
                "resource {:?} is of class {:?}, expected {:?}",
                expected.name,
                instance.spec.class.reference.canonical(),
                expected.class.reference.canonical()
            )));
            continue;
        }

        inputs.push(ResourceInstance {
            resource_id: instance.resource_id,
            reference: PackageRef::new(provider.spec.package_name.clone(), expected.name.clone()),
            spec: instance.spec,
        });
    }

    if !supplied.is_empty() {
        let names: Vec<&str> = supplied.keys().copied().collect();
        errors.push(Error::bad_input(format!(
            "the following specified resource values are not required: {}",
            names.join(", ")
        )));
    }

    Error::from_errors(errors).map_err(|e| e.at(&name))?;

    Ok(ResourceInstance {
        resource_id: scoped_id(parent_id, &name),
        reference: name,
        spec: ResourceSpec {
            source,
            intent,
            intent_type: Some(intent_type),
            class,
            provider: Some(provider),
            inputs,
        },
    })
}

/// Servers and secrets need no provider: the intent names what the
/// resource stands for, which must load.
fn load_primitive(
    ctx: &Context,
    env: &FinalizeEnv<'_>,
    pkg: &Package,
    parent_id: &str,
    source: ResourceInstanceSpec,
    name: PackageRef,
    class: ResourceClass,
) -> Result<ResourceInstance> {
    let owner = pkg.package_name();

    if !source.inputs.is_empty() {
        return Err(Error::bad_input(format!(
            "{} resources take no inputs, {:?} specifies {}",
            class.reference,
            source.name,
            source.inputs.len()
        ))
        .at(owner));
    }

    let Some(raw) = &source.intent else {
        return Err(Error::bad_input(format!(
            "{} resource {:?} requires an intent",
            class.reference, source.name
        ))
        .at(owner));
    };

    let location = if &source.package_name == owner {
        pkg.location.clone()
    } else {
        env.loader.resolve(ctx, &source.package_name)?
    };
    let ensure = |requested: &PackageName| ensure_package(ctx, env, pkg, requested);
    let pctx = ParseContext {
        location: &location,
        ensure_package: &ensure,
    };

    let reference = match raw {
        // A bare package name is enough to identify a server.
        Value::String(s) if is_server_resource(&class.reference) && !s.contains(':') => {
            let server = PackageName::parse(s).map_err(|e| e.at(owner))?;
            ensure(&server)?;
            PackageRef::new(server, "")
        }
        _ => allocate_package_ref(&pctx, raw).map_err(|e| e.at(owner))?,
    };

    if is_secret_resource(&class.reference) {
        let exists = if &reference.package_name == owner {
            pkg.lookup_secret(&reference.name).is_some()
        } else {
            env.loader
                .load_by_name(ctx, &reference.package_name)?
                .lookup_secret(&reference.name)
                .is_some()
        };
        if !exists {
            return Err(Error::bad_input(format!("{}: no such secret", reference)).at(owner));
        }
    }

    let value = serde_json::to_value(&reference)
        .map_err(|e| Error::internal(format!("failed to serialize package ref: {}", e)))?;
    let intent = TypedValue::from_json(PACKAGE_REF_TYPE, &value)?;

    Ok(ResourceInstance {
        resource_id: scoped_id(parent_id, &name),
        reference: name,
        spec: ResourceSpec {
            source,
            intent: Some(intent),
            intent_type: Some(class.intent_type.clone()),
            class,
            provider: None,
            inputs: Vec::new(),
        },
    })
}

fn parse_intent(
    ctx: &Context,
    env: &FinalizeEnv<'_>,
    pkg: &Package,
    resource_package: &PackageName,
    intent_type: &UserType,
    raw: &Value,
) -> Result<TypedValue> {
    let location = if resource_package == pkg.package_name() {
        pkg.location.clone()
    } else {
        env.loader.resolve(ctx, resource_package)?
    };

    let ensure = |requested: &PackageName| ensure_package(ctx, env, pkg, requested);
    let pctx = ParseContext {
        location: &location,
        ensure_package: &ensure,
    };

    allocate_intent(&pctx, intent_type, raw)
}
