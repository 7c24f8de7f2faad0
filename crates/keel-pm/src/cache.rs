//! Module cache
//!
//! Downloaded modules live in a directory keyed by module name and version:
//!
//! ```text
//! <root>/
//! ├── example.com!lib/
//! │   ├── 4f1c3a9e.../        # a module checkout at a pinned version
//! │   └── tmp-1a2b3c4d/       # a clone in progress
//! ```
//!
//! Entries are populated in a temporary sibling directory and renamed into
//! place, so a present directory is always a complete checkout.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "KEEL_CACHE_DIR";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors that can occur during cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error (file operations)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Cache directory could not be determined
    #[error("Failed to determine cache directory: {0}")]
    CacheInitError(String),

    /// Module name or version would escape the cache root
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),
}

/// Versioned module cache
#[derive(Debug, Clone)]
pub struct ModuleCache {
    root: PathBuf,
}

impl ModuleCache {
    /// Create a cache rooted at `root`
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create a cache at `$KEEL_CACHE_DIR`, or the user cache directory
    pub fn default_cache() -> Result<Self, CacheError> {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
            return Ok(Self::new(PathBuf::from(dir)));
        }

        let base = dirs::cache_dir().ok_or_else(|| {
            CacheError::CacheInitError("Could not determine user cache directory".to_string())
        })?;

        Ok(Self::new(base.join("keel").join("modules")))
    }

    /// Get the cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `module` at `version`
    pub fn module_dir(&self, module: &str, version: &str) -> Result<PathBuf, CacheError> {
        validate_key(module)?;
        validate_key(version)?;
        if version.contains('/') {
            return Err(CacheError::InvalidKey(version.to_string()));
        }
        Ok(self.root.join(escape_module(module)).join(version))
    }

    /// Check if `module` at `version` is present
    pub fn contains(&self, module: &str, version: &str) -> bool {
        self.module_dir(module, version)
            .map(|dir| dir.is_dir())
            .unwrap_or(false)
    }

    /// A fresh temporary directory path next to the module's entries. The
    /// directory itself is not created.
    pub fn temp_dir(&self, module: &str) -> Result<PathBuf, CacheError> {
        validate_key(module)?;
        let parent = self.root.join(escape_module(module));
        fs::create_dir_all(&parent)?;
        Ok(parent.join(format!("tmp-{}", unique_suffix(module))))
    }

    /// Move a populated temporary directory into its final location. With
    /// `force`, a previous entry is removed first.
    pub fn promote(&self, tmp: &Path, module: &str, version: &str, force: bool) -> Result<PathBuf, CacheError> {
        let dest = self.module_dir(module, version)?;

        if force {
            // The entry may not exist; if removal fails for another reason
            // the rename below reports it.
            let _ = fs::remove_dir_all(&dest);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::rename(tmp, &dest)?;
        Ok(dest)
    }

    /// Remove every cached module
    pub fn clear(&self) -> Result<(), CacheError> {
        if !self.root.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            }
        }

        Ok(())
    }
}

/// Module names are flattened into a single directory level.
pub fn escape_module(module: &str) -> String {
    module.replace(['/', '\\'], "!")
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() || key == "." || key.split(['/', '\\']).any(|s| s == "..") {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn unique_suffix(module: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let count = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(module.as_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(count.to_le_bytes());
    hex::encode(&hasher.finalize()[..4])
}
