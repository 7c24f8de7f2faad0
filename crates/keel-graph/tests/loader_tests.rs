//! Integration tests for the concurrent package loader

mod common;

use common::*;
use keel_graph::schema::{PackageName, PackageType};
use keel_graph::{Context, Error, ErrorKind, PackageLoader};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_concurrent_loads_parse_once() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/svc", service(&[]));
    frontend.delay("example.com/app/svc", Duration::from_millis(50));

    let loader = root_loader(temp.path(), frontend.clone());
    let name = PackageName::new("example.com/app/svc");

    let loaded: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| loader.load_by_name(&Context::background(), &name).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(frontend.parses("example.com/app/svc"), 1);
    for pkg in &loaded[1..] {
        assert!(Arc::ptr_eq(&loaded[0], pkg));
    }

    // Later loads hit the memoized package.
    let again = loader.load_by_name(&Context::background(), &name).unwrap();
    assert!(Arc::ptr_eq(&loaded[0], &again));
    assert_eq!(frontend.parses("example.com/app/svc"), 1);
}

#[test]
fn test_failures_are_memoized() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    let loader = root_loader(temp.path(), frontend.clone());
    let name = PackageName::new("example.com/app/missing");

    let first = loader.load_by_name(&Context::background(), &name).unwrap_err();
    let second = loader.load_by_name(&Context::background(), &name).unwrap_err();

    assert_eq!(first.kind(), ErrorKind::BadInput);
    assert_eq!(first.to_string(), second.to_string());
    assert_eq!(frontend.parses("example.com/app/missing"), 1);
}

#[test]
fn test_parse_time_cycle() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/a", service(&[]));
    frontend.define("example.com/app/b", service(&[]));
    frontend.load_during_parse("example.com/app/a", &["example.com/app/b"]);
    frontend.load_during_parse("example.com/app/b", &["example.com/app/a"]);

    let loader = root_loader(temp.path(), frontend);
    let err = loader
        .load_by_name(&Context::background(), &PackageName::new("example.com/app/a"))
        .unwrap_err();

    match err {
        Error::CycleDetected { path } => {
            assert_eq!(path, vec!["example.com/app/a", "example.com/app/b", "example.com/app/a"]);
        }
        other => panic!("expected a cycle, got {:?}", other),
    }
}

#[test]
fn test_cross_thread_cycle_does_not_deadlock() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/a", service(&[]));
    frontend.define("example.com/app/b", service(&[]));
    frontend.load_during_parse("example.com/app/a", &["example.com/app/b"]);
    frontend.load_during_parse("example.com/app/b", &["example.com/app/a"]);
    frontend.delay("example.com/app/a", Duration::from_millis(50));
    frontend.delay("example.com/app/b", Duration::from_millis(50));

    let loader = root_loader(temp.path(), frontend);

    let (a, b) = thread::scope(|s| {
        let a = s.spawn(|| loader.load_by_name(&Context::background(), &PackageName::new("example.com/app/a")));
        let b = s.spawn(|| loader.load_by_name(&Context::background(), &PackageName::new("example.com/app/b")));
        (a.join().unwrap(), b.join().unwrap())
    });

    assert_eq!(a.unwrap_err().kind(), ErrorKind::CycleDetected);
    assert_eq!(b.unwrap_err().kind(), ErrorKind::CycleDetected);
}

#[test]
fn test_cancelled_waiter_does_not_disturb_others() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/slow", service(&[]));
    frontend.delay("example.com/app/slow", Duration::from_millis(200));

    let loader = root_loader(temp.path(), frontend.clone());
    let name = PackageName::new("example.com/app/slow");

    let waiter_ctx = Context::background();
    let (worker, cancelled, patient) = thread::scope(|s| {
        let worker = s.spawn(|| loader.load_by_name(&Context::background(), &name));
        thread::sleep(Duration::from_millis(20));

        let cancelled = s.spawn(|| loader.load_by_name(&waiter_ctx, &name));
        let patient = s.spawn(|| loader.load_by_name(&Context::background(), &name));

        thread::sleep(Duration::from_millis(20));
        waiter_ctx.cancel();

        (worker.join().unwrap(), cancelled.join().unwrap(), patient.join().unwrap())
    });

    assert_eq!(cancelled.unwrap_err().kind(), ErrorKind::Cancelled);
    let worker = worker.unwrap();
    let patient = patient.unwrap();
    assert!(Arc::ptr_eq(&worker, &patient));
    assert_eq!(frontend.parses("example.com/app/slow"), 1);
}

#[test]
fn test_cancelled_worker_lets_waiters_retry() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/slow", service(&[]));
    frontend.delay("example.com/app/slow", Duration::from_millis(100));

    let loader = root_loader(temp.path(), frontend.clone());
    let name = PackageName::new("example.com/app/slow");

    let worker_ctx = Context::background();
    let (worker, waiter) = thread::scope(|s| {
        let worker = s.spawn(|| loader.load_by_name(&worker_ctx, &name));
        thread::sleep(Duration::from_millis(20));

        let waiter = s.spawn(|| loader.load_by_name(&Context::background(), &name));
        thread::sleep(Duration::from_millis(20));
        worker_ctx.cancel();

        (worker.join().unwrap(), waiter.join().unwrap())
    });

    assert_eq!(worker.unwrap_err().kind(), ErrorKind::Cancelled);
    waiter.unwrap();
    assert_eq!(frontend.parses("example.com/app/slow"), 2);

    // The successful retry is what stays memoized.
    loader.load_by_name(&Context::background(), &name).unwrap();
    assert_eq!(frontend.parses("example.com/app/slow"), 2);
}

#[test]
fn test_waiter_deadline() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/slow", service(&[]));
    frontend.delay("example.com/app/slow", Duration::from_millis(200));

    let loader = root_loader(temp.path(), frontend);
    let name = PackageName::new("example.com/app/slow");

    let (worker, hurried) = thread::scope(|s| {
        let worker = s.spawn(|| loader.load_by_name(&Context::background(), &name));
        thread::sleep(Duration::from_millis(20));
        let hurried = s.spawn(|| {
            let ctx = Context::background().with_timeout(Duration::from_millis(30));
            loader.load_by_name(&ctx, &name)
        });
        (worker.join().unwrap(), hurried.join().unwrap())
    });

    worker.unwrap();
    assert_eq!(hurried.unwrap_err().kind(), ErrorKind::DeadlineExceeded);
}

#[test]
fn test_sealed_packages_snapshot() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/b", service(&[]));
    frontend.define("example.com/app/a", service(&[]));

    let loader = root_loader(temp.path(), frontend);
    let ctx = Context::background();
    loader.load_by_name(&ctx, &PackageName::new("example.com/app/b")).unwrap();
    loader.load_by_name(&ctx, &PackageName::new("example.com/app/a")).unwrap();

    let sealed = loader.seal();
    let names: Vec<_> = sealed.packages().iter().map(|p| p.package_name().to_string()).collect();
    assert_eq!(names, vec!["example.com/app/a", "example.com/app/b"]);
    assert_eq!(sealed.modules().len(), 1);

    let loc = sealed.resolve(&ctx, &PackageName::new("example.com/app/a")).unwrap();
    assert_eq!(loc.rel_path, "a");
    sealed.load_by_name(&ctx, &PackageName::new("example.com/app/a")).unwrap();

    let err = sealed
        .load_by_name(&ctx, &PackageName::new("example.com/app/c"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    let loc = sealed.resolve(&ctx, &PackageName::new(ROOT)).unwrap();
    assert_eq!(loc.rel_path, ".");
}

#[test]
fn test_stats() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/a", service(&[]));
    frontend.define("example.com/app/b", service(&[]));

    let loader = root_loader(temp.path(), frontend);
    let ctx = Context::background();
    loader.load_by_name(&ctx, &PackageName::new("example.com/app/b")).unwrap();
    loader.load_by_name(&ctx, &PackageName::new("example.com/app/a")).unwrap();

    let stats = loader.stats();
    assert_eq!(stats.loaded_packages, 2);
    assert_eq!(stats.loaded_modules, 1);
    assert_eq!(
        stats.per_module[ROOT],
        vec!["example.com/app/a".to_string(), "example.com/app/b".to_string()]
    );
}

#[test]
fn test_guess_package_type() {
    let temp = tempfile::tempdir().unwrap();
    let frontend = StubFrontend::new();
    frontend.define("example.com/app/server", server("api", &[]));
    frontend.define("example.com/app/ext", extension(&[]));

    let loader = root_loader(temp.path(), frontend.clone());
    let ctx = Context::background();

    let guess = |name: &str| loader.guess_package_type(&ctx, &PackageName::new(name)).unwrap();
    assert_eq!(guess("example.com/app/server"), PackageType::Server);
    assert_eq!(guess("example.com/app/ext"), PackageType::Extension);
    assert_eq!(guess("example.com/app/nothing"), PackageType::None);

    // Guessing does not load.
    assert_eq!(frontend.total_parses(), 0);
}
