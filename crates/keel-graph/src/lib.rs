//! Keel package graph
//!
//! This crate turns package names into a loaded, validated package graph:
//! - Name resolution across the workspace, replaces and pinned modules
//! - A memoizing, concurrent package loader with cycle detection
//! - Finalization, including resource class/provider/instance resolution
//! - Sealing: the ordered dependency closure of a package, with servers
//!   completed from everything they embed

pub mod context;
pub mod error;
pub mod finalize;
pub mod framework;
pub mod frontend;
pub mod intent;
pub mod loader;
pub mod module;
pub mod resolver;
pub mod resources;
pub mod schema;
pub mod sealer;

pub use context::Context;
pub use error::{Error, ErrorKind, Result};
pub use finalize::{finalize_package, stable_server_id, FinalizeEnv};
pub use framework::{
    DockerfileIntegration, FrameworkHandler, FrameworkRegistry, GoIntegration, IntegrationHandler,
    IntegrationRegistry, NodejsIntegration, ServerFrameworkExt,
};
pub use frontend::{Frontend, JsonFrontend, PACKAGE_DEFINITION_FILE};
pub use loader::{Loader, LoaderOptions, LoaderStats, PackageLoader, SealedPackages};
pub use module::{Location, Module};
pub use resolver::{DiscoveringResolver, MissingModuleResolver, ModuleRewrite, TidyRequired};
pub use sealer::{seal, SealHelper, SealState, Sealed};
