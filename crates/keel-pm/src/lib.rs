//! Keel Package Manager Library
//!
//! This crate provides module management for Keel workspaces, including:
//! - Workspace dependency document (keel.workspace.toml)
//! - Versioned module cache
//! - Module discovery over HTTP
//! - Git-backed module downloads and version pinning

pub mod cache;
pub mod cancel;
pub mod discovery;
pub mod fetch;
pub mod git;
pub mod workspace;

pub use cache::{CacheError, ModuleCache};
pub use cancel::{Cancellation, NeverCancel};
pub use discovery::{ModuleDiscovery, ResolvedRepository};
pub use fetch::{FetchError, GitModuleFetcher, LocalModule, ModuleFetcher};
pub use workspace::{
    find_workspace_root, BinaryDigest, Dependency, EnvironmentSpec, Purpose, Replace,
    Requirements, WorkspaceDocument, WorkspaceError, API_VERSION, WORKSPACE_FILENAME,
};
