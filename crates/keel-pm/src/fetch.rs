//! Module fetching
//!
//! Downloads versioned modules into the [`ModuleCache`] and pins module
//! versions to the commit a repository's `HEAD` points at.

use crate::cache::{CacheError, ModuleCache};
use crate::cancel::Cancellation;
use crate::discovery::ModuleDiscovery;
use crate::git;
use crate::workspace::Dependency;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while discovering or downloading modules
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Non-success HTTP status
    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// An external command failed
    #[error("{command}: {message}")]
    Invocation { command: String, message: String },

    /// The module is hosted by a version control system other than git
    #[error("{module}: unsupported repository type {vcs:?}, only git is supported")]
    UnsupportedVcs { module: String, vcs: String },

    /// A discovery document or package name could not be interpreted
    #[error("{0}")]
    InvalidFormat(String),

    /// No discovery rule applies to the package
    #[error("{0}: don't know how to handle package")]
    UnknownModule(String),

    /// The caller abandoned the operation
    #[error("cancelled")]
    Cancelled,

    /// Cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl FetchError {
    /// Errors the operator is expected to fix in their configuration
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            FetchError::UnsupportedVcs { .. } | FetchError::InvalidFormat(_) | FetchError::InvalidUrl(_)
        )
    }
}

/// A module checked out in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModule {
    pub module_name: String,
    pub version: String,
    pub path: PathBuf,
}

/// Source of external modules
pub trait ModuleFetcher: Send + Sync {
    /// Make `dependency` available locally. A cached copy is reused unless
    /// `force` is set.
    fn download(
        &self,
        cancel: &dyn Cancellation,
        dependency: &Dependency,
        force: bool,
    ) -> Result<LocalModule, FetchError>;

    /// Find the module hosting `package_name` and pin it to its current
    /// `HEAD`.
    fn resolve_module_version(
        &self,
        cancel: &dyn Cancellation,
        package_name: &str,
    ) -> Result<Dependency, FetchError>;
}

/// Fetches modules from git repositories found through discovery
pub struct GitModuleFetcher {
    cache: ModuleCache,
    discovery: ModuleDiscovery,
}

impl GitModuleFetcher {
    pub fn new(cache: ModuleCache) -> Result<Self, FetchError> {
        Ok(Self {
            cache,
            discovery: ModuleDiscovery::new()?,
        })
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }
}

impl ModuleFetcher for GitModuleFetcher {
    fn download(
        &self,
        cancel: &dyn Cancellation,
        dependency: &Dependency,
        force: bool,
    ) -> Result<LocalModule, FetchError> {
        let _span = tracing::info_span!(
            "module.download",
            module = %dependency.module,
            version = %dependency.version
        )
        .entered();

        let local = LocalModule {
            module_name: dependency.module.clone(),
            version: dependency.version.clone(),
            path: self.cache.module_dir(&dependency.module, &dependency.version)?,
        };

        if !force && local.path.is_dir() {
            tracing::debug!(path = %local.path.display(), "module cached");
            return Ok(local);
        }

        let repo = self.discovery.resolve(cancel, &dependency.module)?;
        if repo.vcs != "git" {
            return Err(FetchError::UnsupportedVcs {
                module: dependency.module.clone(),
                vcs: repo.vcs,
            });
        }

        let tmp = self.cache.temp_dir(&dependency.module)?;

        let populated = git::clone(cancel, &repo.repository, &tmp)
            .and_then(|_| git::reset_hard(cancel, &tmp, &dependency.version));
        if let Err(err) = populated {
            let _ = std::fs::remove_dir_all(&tmp);
            return Err(err);
        }

        match self.cache.promote(&tmp, &dependency.module, &dependency.version, force) {
            Ok(path) => {
                tracing::info!(path = %path.display(), "downloaded module");
                Ok(LocalModule { path, ..local })
            }
            Err(err) => {
                let _ = std::fs::remove_dir_all(&tmp);
                // Another process may have completed the same download.
                if local.path.is_dir() {
                    return Ok(local);
                }
                Err(err.into())
            }
        }
    }

    fn resolve_module_version(
        &self,
        cancel: &dyn Cancellation,
        package_name: &str,
    ) -> Result<Dependency, FetchError> {
        let _span = tracing::info_span!("module.resolve-head", name = %package_name).entered();

        let repo = self.discovery.resolve(cancel, package_name)?;
        if repo.vcs != "git" {
            return Err(FetchError::UnsupportedVcs {
                module: repo.module,
                vcs: repo.vcs,
            });
        }

        let version = git::ls_remote_head(cancel, &repo.repository)?;
        tracing::debug!(module = %repo.module, version = %version, "pinned module");

        Ok(Dependency {
            module: repo.module,
            version,
        })
    }
}
