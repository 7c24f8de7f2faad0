//! Integration tests for package name resolution

mod common;

use common::*;
use keel_graph::schema::PackageName;
use keel_graph::{Context, DiscoveringResolver, ErrorKind, LoaderOptions, Loader, PackageLoader};
use keel_pm::{Dependency, Replace, WorkspaceDocument};
use std::sync::Arc;

fn document(deps: &[(&str, &str)], replaces: &[(&str, &str)]) -> WorkspaceDocument {
    let mut doc = WorkspaceDocument::new(ROOT);
    doc.dependencies = deps
        .iter()
        .map(|(module, version)| Dependency {
            module: module.to_string(),
            version: version.to_string(),
        })
        .collect();
    doc.replaces = replaces
        .iter()
        .map(|(module, path)| Replace {
            module: module.to_string(),
            path: path.to_string(),
        })
        .collect();
    doc
}

#[test]
fn test_resolve_root_module() {
    let temp = tempfile::tempdir().unwrap();
    let loader = root_loader(temp.path(), StubFrontend::new());
    let ctx = Context::background();

    let loc = loader.resolve(&ctx, &PackageName::new(ROOT)).unwrap();
    assert_eq!(loc.rel_path, ".");
    assert_eq!(loc.abs_path(), temp.path());

    let loc = loader.resolve(&ctx, &PackageName::new("example.com/app/sub/x")).unwrap();
    assert_eq!(loc.rel_path, "sub/x");
    assert_eq!(loc.module_name(), ROOT);
    assert!(!loc.module.is_external());
}

#[test]
fn test_resolve_rejects_malformed_names() {
    let temp = tempfile::tempdir().unwrap();
    let loader = root_loader(temp.path(), StubFrontend::new());
    let ctx = Context::background();

    for name in ["", ".", "example.com//x", "example.com/app/", "example.com/a b", "example.com/app/../x"] {
        let err = loader.resolve(&ctx, &PackageName::new(name)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput, "{:?}", name);
    }
}

#[test]
fn test_resolve_declared_dependency() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    fetcher.serve(&temp.path().join("lib"), "example.com/lib", "example.com/lib");

    let loader = new_loader(
        &temp.path().join("ws"),
        document(&[("example.com/lib", "v1")], &[]),
        StubFrontend::new(),
        fetcher.clone(),
    );
    let ctx = Context::background();

    let loc = loader.resolve(&ctx, &PackageName::new("example.com/lib/http")).unwrap();
    assert_eq!(loc.rel_path, "http");
    assert_eq!(loc.module.version(), "v1");
    assert!(loc.module.is_external());

    // The module is memoized: a second package in it does not download again.
    loader.resolve(&ctx, &PackageName::new("example.com/lib/grpc")).unwrap();
    assert_eq!(fetcher.downloads().len(), 1);
    assert_eq!(loader.stats().loaded_modules, 2);
}

#[test]
fn test_longest_prefix_dependency_wins() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    fetcher.serve(&temp.path().join("lib"), "example.com/lib", "example.com/lib");
    fetcher.serve(&temp.path().join("sub"), "example.com/lib/sub", "example.com/lib/sub");

    let loader = new_loader(
        &temp.path().join("ws"),
        document(&[("example.com/lib", "v1"), ("example.com/lib/sub", "v2")], &[]),
        StubFrontend::new(),
        fetcher,
    );

    let loc = loader
        .resolve(&Context::background(), &PackageName::new("example.com/lib/sub/pkg"))
        .unwrap();
    assert_eq!(loc.module_name(), "example.com/lib/sub");
    assert_eq!(loc.module.version(), "v2");
    assert_eq!(loc.rel_path, "pkg");
}

#[test]
fn test_replace_beats_dependency() {
    let temp = tempfile::tempdir().unwrap();
    let ws = temp.path().join("ws");
    write_workspace(&ws.join("local-lib"), &WorkspaceDocument::new("example.com/lib"));

    let fetcher = StubFetcher::new();
    let loader = new_loader(
        &ws,
        document(&[("example.com/lib", "v1")], &[("example.com/lib", "local-lib")]),
        StubFrontend::new(),
        fetcher.clone(),
    );

    let loc = loader
        .resolve(&Context::background(), &PackageName::new("example.com/lib/http"))
        .unwrap();
    assert_eq!(loc.abs_path(), ws.join("local-lib").join("http"));
    assert_eq!(loc.module.version(), "");
    assert!(fetcher.downloads().is_empty());
}

#[test]
fn test_missing_dependency_requires_tidy() {
    let temp = tempfile::tempdir().unwrap();
    let loader = root_loader(temp.path(), StubFrontend::new());

    let err = loader
        .resolve(&Context::background(), &PackageName::new("example.com/other/pkg"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
    let message = err.to_string();
    assert!(message.contains("example.com/other/pkg"), "{}", message);
    assert!(message.contains("keel.workspace.toml"), "{}", message);
    assert!(message.contains("keelpm tidy"), "{}", message);
}

#[test]
fn test_discovering_resolver_records_dependencies() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    fetcher.serve(&temp.path().join("other"), "example.com/other", "example.com/other");

    let discovering = Arc::new(DiscoveringResolver::new(fetcher.clone()));
    let options = LoaderOptions::new(StubFrontend::new())
        .with_fetcher(fetcher)
        .with_missing_module_resolver(discovering.clone());
    let loader = Loader::new(temp.path().join("ws"), WorkspaceDocument::new(ROOT), options).unwrap();
    let ctx = Context::background();

    loader.resolve(&ctx, &PackageName::new("example.com/other/a")).unwrap();
    loader.resolve(&ctx, &PackageName::new("example.com/other/b")).unwrap();

    let added = discovering.added();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].module, "example.com/other");

    let updated = WorkspaceDocument::new(ROOT).with_dependency(added[0].clone());
    assert!(updated.dependency("example.com/other").is_some());
}

#[test]
fn test_inconsistent_module_name() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    fetcher.serve(&temp.path().join("lib"), "example.com/lib", "example.com/renamed");

    let loader = new_loader(
        &temp.path().join("ws"),
        document(&[("example.com/lib", "v1")], &[]),
        StubFrontend::new(),
        fetcher,
    );

    let err = loader
        .resolve(&Context::background(), &PackageName::new("example.com/lib/x"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("inconsistent definition"));
}

#[test]
fn test_module_without_workspace_document() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    fetcher.serve_dir(&temp.path().join("lib"), "example.com/lib");

    let loader = new_loader(
        &temp.path().join("ws"),
        document(&[("example.com/lib", "v1")], &[]),
        StubFrontend::new(),
        fetcher,
    );

    let err = loader
        .resolve(&Context::background(), &PackageName::new("example.com/lib/x"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadInput);
    assert!(err.to_string().contains("is not a workspace"));
}

#[test]
fn test_module_requiring_newer_api() {
    let temp = tempfile::tempdir().unwrap();
    let mut doc = WorkspaceDocument::new("example.com/lib");
    doc.requirements.minimum_api = keel_pm::API_VERSION + 1;
    write_workspace(&temp.path().join("lib"), &doc);

    let fetcher = StubFetcher::new();
    fetcher.serve_dir(&temp.path().join("lib"), "example.com/lib");

    let loader = new_loader(
        &temp.path().join("ws"),
        document(&[("example.com/lib", "v1")], &[]),
        StubFrontend::new(),
        fetcher,
    );

    let err = loader
        .resolve(&Context::background(), &PackageName::new("example.com/lib/x"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[test]
fn test_rewrite_alias() {
    let temp = tempfile::tempdir().unwrap();
    let options = LoaderOptions::new(StubFrontend::new())
        .with_fetcher(StubFetcher::new())
        .with_rewrite("std.example.com", ROOT, "third_party/std");
    let loader = Loader::new(temp.path().to_path_buf(), WorkspaceDocument::new(ROOT), options).unwrap();

    let loc = loader
        .resolve(&Context::background(), &PackageName::new("std.example.com/http"))
        .unwrap();
    assert_eq!(loc.package_name.as_str(), "example.com/app/third_party/std/http");
    assert_eq!(loc.rel_path, "third_party/std/http");
}

#[test]
fn test_cancelled_context() {
    let temp = tempfile::tempdir().unwrap();
    let loader = root_loader(temp.path(), StubFrontend::new());
    let ctx = Context::background();
    ctx.cancel();

    let err = loader.resolve(&ctx, &PackageName::new("example.com/app/x")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}
