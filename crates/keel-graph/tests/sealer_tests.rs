//! Integration tests for dependency sealing

mod common;

use common::*;
use keel_graph::schema::{
    Binary, BuildPlan, Facet, Framework, FrameworkExt, Instantiate, Mount, Node, PackageDefinition, PackageName,
    PackageRef, ServerFragment, ServiceSpec, Volume, VolumeKind,
};
use keel_graph::{
    Context, Error, ErrorKind, FrameworkHandler, FrameworkRegistry, Loader, LoaderOptions, Location, Result,
    SealHelper, SealState, Sealed, ServerFrameworkExt,
};
use keel_pm::WorkspaceDocument;
use std::path::Path;
use std::sync::Arc;

fn loader_with_frameworks(root_dir: &Path, frontend: Arc<StubFrontend>, frameworks: FrameworkRegistry) -> Loader {
    let options = LoaderOptions::new(frontend)
        .with_fetcher(StubFetcher::new())
        .with_frameworks(frameworks);
    Loader::new(root_dir.to_path_buf(), WorkspaceDocument::new(ROOT), options).unwrap()
}

fn with_node(mut definition: PackageDefinition, f: impl FnOnce(&mut Node)) -> PackageDefinition {
    if let Facet::Node(node) = &mut definition.facet {
        f(node);
    }
    definition
}

fn volume(owner: &str, name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        owner: PackageName::new(owner),
        kind: VolumeKind::Ephemeral,
    }
}

fn dep_names(sealed: &Sealed) -> Vec<String> {
    sealed.deps.iter().map(|d| d.package_name().to_string()).collect()
}

fn seal(loader: &Loader, focus: &str) -> Result<Sealed> {
    loader.seal_package(&Context::background(), &PackageName::new(focus), None)
}

#[test]
fn test_server_collects_volumes_in_rank_order() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/server", server("api", &["example.com/app/e1", "example.com/app/e2"]));
    frontend.define(
        "example.com/app/e1",
        with_node(extension(&[]), |node| {
            node.volumes.push(volume("example.com/app/e1", "v1"));
            node.mounts.push(Mount {
                owner: PackageName::new("example.com/app/e1"),
                path: "/data".to_string(),
                volume_ref: PackageRef::new("example.com/app/e1", "v1"),
                readonly: false,
            });
        }),
    );
    frontend.define(
        "example.com/app/e2",
        with_node(extension(&[]), |node| node.volumes.push(volume("example.com/app/e2", "v2"))),
    );

    let loader = root_loader(temp.path(), frontend);
    let sealed = seal(&loader, "example.com/app/server").unwrap();

    assert_eq!(dep_names(&sealed), vec!["example.com/app/e1", "example.com/app/e2"]);

    let server = sealed.server.as_ref().unwrap();
    let volumes: Vec<_> = server.self_fragment.volumes.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(volumes, vec!["v1", "v2"]);
    assert_eq!(server.self_fragment.main_container.mounts.len(), 1);
    assert_eq!(
        server.imports,
        vec![PackageName::new("example.com/app/e1"), PackageName::new("example.com/app/e2")]
    );
    assert_eq!(
        sealed.parsed_package.as_ref().unwrap().package_name().as_str(),
        "example.com/app/server"
    );

    // The loaded server is left untouched.
    let loaded = sealed.parsed_package.as_ref().unwrap().server().unwrap().clone();
    assert!(loaded.self_fragment.volumes.is_empty());
}

#[test]
fn test_dependencies_before_dependents() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/server", server("api", &["example.com/app/a", "example.com/app/b"]));
    frontend.define("example.com/app/a", extension(&["example.com/app/c"]));
    frontend.define("example.com/app/b", extension(&[]));
    frontend.define("example.com/app/c", extension(&[]));

    let loader = root_loader(temp.path(), frontend);
    let sealed = seal(&loader, "example.com/app/server").unwrap();

    assert_eq!(
        dep_names(&sealed),
        vec!["example.com/app/c", "example.com/app/a", "example.com/app/b"]
    );
    let imports: Vec<_> = sealed.server.unwrap().imports.iter().map(|p| p.to_string()).collect();
    assert_eq!(imports, vec!["example.com/app/c", "example.com/app/a", "example.com/app/b"]);
}

#[test]
fn test_volume_with_foreign_owner() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/server", server("api", &["example.com/app/e1"]));
    frontend.define(
        "example.com/app/e1",
        with_node(extension(&[]), |node| node.volumes.push(volume("example.com/app/other", "v1"))),
    );

    let loader = root_loader(temp.path(), frontend);
    let err = seal(&loader, "example.com/app/server").unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BadInput);
    assert!(err.to_string().contains("didn't expect owner"), "{}", err);
}

#[test]
fn test_diamond_loads_each_package_once() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/top", service(&["example.com/app/left", "example.com/app/right"]));
    frontend.define("example.com/app/left", extension(&["example.com/app/bottom"]));
    frontend.define("example.com/app/right", extension(&["example.com/app/bottom"]));
    frontend.define("example.com/app/bottom", extension(&[]));

    let loader = root_loader(temp.path(), frontend.clone());
    let sealed = seal(&loader, "example.com/app/top").unwrap();

    for name in ["top", "left", "right", "bottom"] {
        assert_eq!(frontend.parses(&format!("example.com/app/{}", name)), 1, "{}", name);
    }
    assert_eq!(
        dep_names(&sealed),
        vec![
            "example.com/app/bottom",
            "example.com/app/left",
            "example.com/app/right",
            "example.com/app/top",
        ]
    );
    assert!(sealed.server.is_none());
    assert!(sealed.has_dep(&PackageName::new("example.com/app/top")));
    assert!(!sealed.has_dep(&PackageName::new("example.com/app/elsewhere")));
    assert_eq!(sealed.location.rel_path, "top");
}

#[test]
fn test_import_cycle() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/a", extension(&["example.com/app/b"]));
    frontend.define("example.com/app/b", extension(&["example.com/app/a"]));

    let loader = root_loader(temp.path(), frontend);
    let err = seal(&loader, "example.com/app/a").unwrap_err();

    match err {
        Error::CycleDetected { path } => {
            assert_eq!(path, vec!["example.com/app/a", "example.com/app/b", "example.com/app/a"]);
        }
        other => panic!("expected a cycle, got {:?}", other),
    }
}

#[test]
fn test_missing_dependency_fails_seal() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/a", extension(&["example.com/app/nowhere"]));

    let loader = root_loader(temp.path(), frontend);
    let err = seal(&loader, "example.com/app/a").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadInput);
    assert!(err.to_string().contains("example.com/app/nowhere"), "{}", err);
}

#[test]
fn test_sealing_is_deterministic() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define(
        "example.com/app/server",
        server("api", &["example.com/app/d", "example.com/app/b", "example.com/app/frag"]),
    );
    frontend.define("example.com/app/d", extension(&["example.com/app/a"]));
    frontend.define("example.com/app/b", extension(&["example.com/app/a", "example.com/app/c"]));
    frontend.define("example.com/app/a", extension(&[]));
    frontend.define("example.com/app/c", extension(&[]));
    frontend.define(
        "example.com/app/frag",
        PackageDefinition {
            facet: Facet::Fragment(ServerFragment {
                services: vec![ServiceSpec {
                    name: "http".to_string(),
                    port: 8080,
                    protocol: None,
                }],
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    let loader = root_loader(temp.path(), frontend);
    let first = seal(&loader, "example.com/app/server").unwrap();

    for _ in 0..5 {
        let again = seal(&loader, "example.com/app/server").unwrap();
        assert_eq!(dep_names(&again), dep_names(&first));
        assert_eq!(again.server, first.server);
    }
}

#[test]
fn test_second_server_in_closure() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/server", server("api", &["example.com/app/other"]));
    frontend.define("example.com/app/other", server("other", &[]));

    let loader = root_loader(temp.path(), frontend);
    let err = seal(&loader, "example.com/app/server").unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("server already defined"), "{}", err);
}

#[test]
fn test_service_of_another_framework() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();

    let mut definition = server("api", &["example.com/app/svc"]);
    if let Facet::Server(server) = &mut definition.facet {
        server.framework = Framework::Go;
    }
    frontend.define("example.com/app/server", definition);
    frontend.define(
        "example.com/app/svc",
        with_node(service(&[]), |node| node.service_framework = Framework::Nodejs),
    );

    let loader = root_loader(temp.path(), frontend);
    let err = seal(&loader, "example.com/app/server").unwrap_err();

    assert_eq!(err.kind(), ErrorKind::BadInput);
    assert!(err.to_string().contains("can only embed services of its framework"), "{}", err);
}

#[test]
fn test_fragments_merge_into_server() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();

    let mut definition = server("api", &["example.com/app/frag"]);
    if let Facet::Server(server) = &mut definition.facet {
        server.self_fragment.services.push(ServiceSpec {
            name: "grpc".to_string(),
            port: 9000,
            protocol: None,
        });
    }
    frontend.define("example.com/app/server", definition);
    frontend.define(
        "example.com/app/frag",
        PackageDefinition {
            facet: Facet::Fragment(ServerFragment {
                services: vec![ServiceSpec {
                    name: "http".to_string(),
                    port: 8080,
                    protocol: None,
                }],
                volumes: vec![volume("example.com/app/frag", "cache")],
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    let loader = root_loader(temp.path(), frontend);
    let sealed = seal(&loader, "example.com/app/server").unwrap();

    assert_eq!(sealed.fragments.len(), 1);
    assert!(sealed.deps.is_empty());

    let server = sealed.server.unwrap();
    let services: Vec<_> = server.self_fragment.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(services, vec!["http", "grpc"]);
    assert_eq!(server.self_fragment.volumes.len(), 1);
}

#[test]
fn test_fragment_with_foreign_volume() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/server", server("api", &["example.com/app/frag"]));
    frontend.define(
        "example.com/app/frag",
        PackageDefinition {
            facet: Facet::Fragment(ServerFragment {
                volumes: vec![volume("example.com/app/else", "cache")],
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    let loader = root_loader(temp.path(), frontend);
    let err = seal(&loader, "example.com/app/server").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadInput);
}

#[test]
fn test_allocations_follow_instantiation() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();

    let instantiate = |name: &str, pkg: &str| Instantiate {
        name: name.to_string(),
        package_name: Some(PackageName::new(pkg)),
        type_name: "Client".to_string(),
    };

    frontend.define("example.com/app/server", server("api", &["example.com/app/a"]));
    frontend.define(
        "example.com/app/a",
        with_node(service(&[]), |node| node.instantiate.push(instantiate("b", "example.com/app/b"))),
    );
    frontend.define(
        "example.com/app/b",
        with_node(extension(&[]), |node| node.instantiate.push(instantiate("c", "example.com/app/c"))),
    );
    frontend.define("example.com/app/c", extension(&[]));

    let loader = root_loader(temp.path(), frontend);
    let sealed = seal(&loader, "example.com/app/server").unwrap();

    // Instantiated packages are implicit imports.
    assert_eq!(
        dep_names(&sealed),
        vec!["example.com/app/c", "example.com/app/b", "example.com/app/a"]
    );

    let server = sealed.server.unwrap();
    assert_eq!(server.allocation.len(), 2);

    let from_b = &server.allocation[0].instances[0];
    assert_eq!(from_b.owner.as_str(), "example.com/app/b");
    assert_eq!(from_b.package_name.as_str(), "example.com/app/c");
    assert_eq!(from_b.alloc_name, "0");

    let from_a = &server.allocation[1].instances[0];
    assert_eq!(from_a.owner.as_str(), "example.com/app/a");
    assert_eq!(from_a.package_name.as_str(), "example.com/app/b");
    assert_eq!(from_a.alloc_name, "1");
    assert_eq!(from_a.instantiated[0].name, "b");

    let nested = &from_a.downstream[0].instances[0];
    assert_eq!(nested.package_name.as_str(), "example.com/app/c");
    assert_eq!(nested.alloc_name, "1.2");
}

struct GoHandler;

impl FrameworkHandler for GoHandler {
    fn pre_parse_server(&self, _ctx: &Context, loc: &Location, ext: &mut ServerFrameworkExt) -> Result<()> {
        ext.include.push(PackageName::new("example.com/app/go/runtime"));
        ext.framework_specific = Some(FrameworkExt {
            kind: "go".to_string(),
            value: serde_json::json!({ "package": loc.package_name.as_str() }),
        });
        Ok(())
    }

    fn post_parse_server(&self, _ctx: &Context, sealed: &mut Sealed) -> Result<()> {
        if let Some(server) = &mut sealed.server {
            server.self_fragment.main_container.args.push("--listen=:8080".to_string());
        }
        Ok(())
    }

    fn development_packages(&self) -> Vec<PackageName> {
        vec![PackageName::new("example.com/app/go/devtools")]
    }
}

fn go_frontend() -> Arc<StubFrontend> {
    let frontend = StubFrontend::new();
    let mut definition = server("api", &[]);
    if let Facet::Server(server) = &mut definition.facet {
        server.framework = Framework::Go;
    }
    frontend.define("example.com/app/server", definition);
    frontend.define("example.com/app/go/runtime", extension(&[]));
    frontend.define("example.com/app/go/devtools", extension(&[]));
    frontend
}

fn go_frameworks() -> FrameworkRegistry {
    let mut frameworks = FrameworkRegistry::new();
    frameworks.register(Framework::Go, Arc::new(GoHandler));
    frameworks
}

#[test]
fn test_framework_hooks() {
    let temp = tempfile::tempdir().unwrap();
    let loader = loader_with_frameworks(temp.path(), go_frontend(), go_frameworks());

    let sealed = seal(&loader, "example.com/app/server").unwrap();
    assert!(sealed.has_dep(&PackageName::new("example.com/app/go/runtime")));
    assert!(!sealed.has_dep(&PackageName::new("example.com/app/go/devtools")));

    let server = sealed.server.unwrap();
    assert_eq!(server.framework_ext.len(), 1);
    assert_eq!(server.framework_ext[0].kind, "go");
    assert_eq!(server.self_fragment.main_container.args, vec!["--listen=:8080"]);
}

#[test]
fn test_development_helper_adds_packages() {
    let temp = tempfile::tempdir().unwrap();
    let frameworks = go_frameworks();
    let loader = loader_with_frameworks(temp.path(), go_frontend(), frameworks.clone());

    let helper = SealHelper::development(frameworks);
    let sealed = loader
        .seal_package(&Context::background(), &PackageName::new("example.com/app/server"), Some(&helper))
        .unwrap();

    assert!(sealed.has_dep(&PackageName::new("example.com/app/go/runtime")));
    assert!(sealed.has_dep(&PackageName::new("example.com/app/go/devtools")));
}

#[test]
fn test_helper_errors_fail_seal() {
    let temp = tempfile::tempdir().unwrap();
    let loader = loader_with_frameworks(temp.path(), go_frontend(), go_frameworks());

    let helper = SealHelper::new(|_| Err(Error::usage("no development packages for this framework", "pick another framework")));
    let err = loader
        .seal_package(&Context::background(), &PackageName::new("example.com/app/server"), Some(&helper))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[test]
fn test_cancelled_seal() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/a", extension(&[]));

    let loader = root_loader(temp.path(), frontend.clone());
    let ctx = Context::background();
    ctx.cancel();

    let err = loader
        .seal_package(&ctx, &PackageName::new("example.com/app/a"), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(frontend.total_parses(), 0);
}

#[test]
fn test_empty_package_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/empty", PackageDefinition::default());
    frontend.define(
        "example.com/app/tool",
        PackageDefinition {
            binaries: vec![Binary::new("tool", BuildPlan::Go { package: ".".into() })],
            ..Default::default()
        },
    );

    let loader = root_loader(temp.path(), frontend);

    let err = seal(&loader, "example.com/app/empty").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadInput);
    assert!(err.to_string().contains("no server, and no node?"), "{}", err);
    assert!(err.to_string().contains("example.com/app/empty"), "{}", err);

    // Binaries alone are a valid package.
    let sealed = seal(&loader, "example.com/app/tool").unwrap();
    assert!(sealed.server.is_none());
    assert!(sealed.deps.is_empty());
}

#[test]
fn test_every_visited_package_is_done() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/server", server("api", &["example.com/app/a"]));
    frontend.define("example.com/app/a", extension(&["example.com/app/b"]));
    frontend.define("example.com/app/b", extension(&[]));

    let loader = root_loader(temp.path(), frontend);
    let sealed = seal(&loader, "example.com/app/server").unwrap();

    let visited: Vec<_> = sealed.states.keys().map(|p| p.to_string()).collect();
    assert_eq!(visited, vec!["example.com/app/a", "example.com/app/b", "example.com/app/server"]);
    assert!(sealed.states.values().all(|s| *s == SealState::Done));
    assert_eq!(sealed.state(&PackageName::new("example.com/app/b")), Some(SealState::Done));
    assert_eq!(sealed.state(&PackageName::new("example.com/app/c")), None);
}

#[test]
fn test_fragment_order_ignores_import_order() {
    fn fragment(service: &str, port: u16, volume_name: &str, owner: &str) -> PackageDefinition {
        PackageDefinition {
            facet: Facet::Fragment(ServerFragment {
                services: vec![ServiceSpec {
                    name: service.to_string(),
                    port,
                    protocol: None,
                }],
                volumes: vec![volume(owner, volume_name)],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    let seal_with = |imports: &[&str]| {
        let temp = tempfile::tempdir().unwrap();
        let frontend = StubFrontend::new();
        frontend.define("example.com/app/server", server("api", imports));
        frontend.define("example.com/app/web", fragment("http", 8080, "assets", "example.com/app/web"));
        frontend.define("example.com/app/rpc", fragment("grpc", 9000, "sockets", "example.com/app/rpc"));
        let loader = root_loader(temp.path(), frontend);
        seal(&loader, "example.com/app/server").unwrap()
    };

    let first = seal_with(&["example.com/app/web", "example.com/app/rpc"]);
    let second = seal_with(&["example.com/app/rpc", "example.com/app/web"]);

    let fragment_names = |sealed: &Sealed| -> Vec<String> {
        sealed.fragments.iter().map(|f| f.package_name().to_string()).collect()
    };
    assert_eq!(fragment_names(&first).len(), 2);
    assert_eq!(fragment_names(&first), fragment_names(&second));

    let first_server = first.server.as_ref().unwrap();
    let second_server = second.server.as_ref().unwrap();
    assert_eq!(first_server.self_fragment, second_server.self_fragment);
    assert_eq!(first_server.self_fragment.volumes.len(), 2);
}
