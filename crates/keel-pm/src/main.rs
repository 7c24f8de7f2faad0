//! Keel Package Manager (keelpm)

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use keel_pm::{
    find_workspace_root, GitModuleFetcher, ModuleCache, ModuleFetcher, NeverCancel,
    WorkspaceDocument, API_VERSION, WORKSPACE_FILENAME,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keelpm")]
#[command(about = "Keel module manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Workspace directory (defaults to the nearest enclosing workspace)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Module cache directory (overrides KEEL_CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pin the module hosting a package to its current HEAD and add it
    Get {
        /// Package name
        package: String,
    },
    /// Pin the modules of any undeclared packages, download every pinned
    /// dependency and rewrite the workspace document
    Tidy {
        /// Packages whose modules should be declared
        packages: Vec<String>,
    },
    /// Download every pinned dependency into the module cache
    Download {
        /// Replace cached copies
        #[arg(long)]
        force: bool,
    },
    /// Remove every cached module
    ClearCache,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cache = match &cli.cache_dir {
        Some(dir) => ModuleCache::new(dir.clone()),
        None => ModuleCache::default_cache()?,
    };

    if let Commands::ClearCache = cli.command {
        cache.clear()?;
        tracing::info!(root = %cache.root().display(), "cleared module cache");
        return Ok(());
    }

    let root = match cli.workspace {
        Some(dir) => dir,
        None => {
            let cwd = std::env::current_dir()?;
            match find_workspace_root(&cwd) {
                Some(root) => root,
                None => bail!("no {} found in {} or any parent", WORKSPACE_FILENAME, cwd.display()),
            }
        }
    };
    let doc_path = root.join(WORKSPACE_FILENAME);
    let mut doc = WorkspaceDocument::from_file(&doc_path)
        .with_context(|| format!("loading {}", doc_path.display()))?;
    doc.check_api_requirements(API_VERSION)?;

    let fetcher = GitModuleFetcher::new(cache)?;

    match cli.command {
        Commands::Get { package } => {
            let dep = fetcher.resolve_module_version(&NeverCancel, &package)?;
            fetcher.download(&NeverCancel, &dep, false)?;
            println!("{} {}", dep.module, dep.version);
            doc = doc.with_dependency(dep);
            doc.to_file(&doc_path)?;
        }
        Commands::Tidy { packages } => {
            for package in &packages {
                if is_declared(&doc, package) {
                    continue;
                }
                let dep = fetcher
                    .resolve_module_version(&NeverCancel, package)
                    .with_context(|| format!("resolving {}", package))?;
                tracing::info!(module = %dep.module, version = %dep.version, "adding dependency");
                doc = doc.with_dependency(dep);
            }
            download_all(&fetcher, &doc, false)?;
            doc.to_file(&doc_path)?;
        }
        Commands::Download { force } => {
            download_all(&fetcher, &doc, force)?;
        }
        Commands::ClearCache => {}
    }

    Ok(())
}

/// Whether a declared dependency or replace already covers `package`.
fn is_declared(doc: &WorkspaceDocument, package: &str) -> bool {
    let covers = |module: &str| package == module || package.starts_with(&format!("{}/", module));
    package == doc.module
        || package.starts_with(&format!("{}/", doc.module))
        || doc.dependencies.iter().any(|d| covers(&d.module))
        || doc.replaces.iter().any(|r| covers(&r.module))
}

fn download_all(fetcher: &GitModuleFetcher, doc: &WorkspaceDocument, force: bool) -> anyhow::Result<()> {
    for dep in &doc.dependencies {
        if doc.replaces.iter().any(|r| r.module == dep.module) {
            continue;
        }
        let local = fetcher
            .download(&NeverCancel, dep, force)
            .with_context(|| format!("downloading {}", dep.module))?;
        println!("{} {} {}", local.module_name, local.version, local.path.display());
    }
    Ok(())
}
