//! Module discovery
//!
//! Maps a package name to the repository that hosts its module. A host
//! advertises its modules with an HTML meta tag served at
//! `https://<package>?foundation-get=1`:
//!
//! ```html
//! <meta name="foundation-import" content="example.com/lib git https://git.example.com/lib">
//! ```
//!
//! Packages under `github.com/org/repo` fall back to the repository
//! convention when no tag is served.

use crate::cancel::Cancellation;
use crate::fetch::FetchError;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use std::io::Read;
use std::time::Duration;

/// Name of the meta tag carrying the import declaration
pub const IMPORT_META_NAME: &str = "foundation-import";

/// HTTP client configuration
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Discovery documents are small; anything larger is not one.
pub const MAX_DOCUMENT_SIZE: u64 = 1024 * 1024;

static META_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<meta\b([^>]*)>").expect("meta tag pattern")
});

static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)([a-z][a-z0-9_:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("attribute pattern")
});

/// Where a package's module is hosted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRepository {
    /// Name of the module containing the package
    pub module: String,
    /// Version control system, only `git` is supported
    pub vcs: String,
    /// Repository URL
    pub repository: String,
    /// Path of the package within the module, empty for the module itself
    pub rel_path: String,
}

/// HTTP-based module discovery
pub struct ModuleDiscovery {
    client: Client,
}

impl ModuleDiscovery {
    /// Create a discovery client
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("keel-pm/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    /// Resolve the repository hosting `package_name`
    pub fn resolve(
        &self,
        cancel: &dyn Cancellation,
        package_name: &str,
    ) -> Result<ResolvedRepository, FetchError> {
        let _span = tracing::info_span!("module.resolve", name = %package_name).entered();

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        match self.fetch_document(package_name) {
            Ok(doc) => {
                if let Some(resolved) = parse_discovery_document(package_name, &doc)? {
                    return Ok(resolved);
                }
            }
            // Hosts following the github convention are not expected to
            // serve discovery documents.
            Err(err) if package_name.starts_with("github.com/") => {
                tracing::debug!(error = %err, "discovery request failed, using github convention");
            }
            Err(err) => return Err(err),
        }

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        if package_name.starts_with("github.com/") {
            return parse_github_package(package_name);
        }

        Err(FetchError::UnknownModule(package_name.to_string()))
    }

    fn fetch_document(&self, package_name: &str) -> Result<String, FetchError> {
        let address = format!("https://{}?foundation-get=1", package_name);
        let parsed = url::Url::parse(&address).map_err(|_| FetchError::InvalidUrl(address.clone()))?;

        let response = self.client.get(parsed).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: address,
            });
        }

        let mut body = String::new();
        response.take(MAX_DOCUMENT_SIZE).read_to_string(&mut body)?;
        Ok(body)
    }
}

/// Find the content of the first `foundation-import` meta tag in `html`.
pub fn find_import_meta(html: &str) -> Option<String> {
    for tag in META_TAG.captures_iter(html) {
        let attrs = &tag[1];

        let mut name = None;
        let mut content = None;
        for attr in ATTRIBUTE.captures_iter(attrs) {
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .or_else(|| attr.get(4))
                .map(|m| m.as_str().to_string());

            match attr[1].to_ascii_lowercase().as_str() {
                "name" => name = value,
                "content" => content = value,
                _ => {}
            }
        }

        if name.as_deref() == Some(IMPORT_META_NAME) {
            if let Some(content) = content {
                return Some(content);
            }
        }
    }

    None
}

/// Interpret a discovery document. Returns `Ok(None)` when the document
/// carries no usable declaration.
pub fn parse_discovery_document(
    package_name: &str,
    html: &str,
) -> Result<Option<ResolvedRepository>, FetchError> {
    let Some(content) = find_import_meta(html) else {
        return Ok(None);
    };

    let parts: Vec<&str> = content.split_whitespace().collect();

    match parts.as_slice() {
        [module, vcs, repository] => {
            let rel_path = if *module == package_name {
                String::new()
            } else {
                match package_name.strip_prefix(&format!("{}/", module)) {
                    Some(rel) => rel.to_string(),
                    None => {
                        return Err(FetchError::InvalidFormat(format!(
                            "{}: resolved package claimed it was module {:?}",
                            package_name, module
                        )))
                    }
                }
            };

            Ok(Some(ResolvedRepository {
                module: module.to_string(),
                vcs: vcs.to_string(),
                repository: repository.to_string(),
                rel_path,
            }))
        }
        [module, vcs, repository, rel] => Ok(Some(ResolvedRepository {
            module: module.to_string(),
            vcs: vcs.to_string(),
            repository: repository.to_string(),
            rel_path: rel.to_string(),
        })),
        _ => {
            tracing::warn!(
                parts = parts.len(),
                content = %content,
                "ignored {} definition, wrong number of parts",
                IMPORT_META_NAME
            );
            Ok(None)
        }
    }
}

/// `github.com/org/repo[/rel]` is hosted at `https://github.com/org/repo`.
pub fn parse_github_package(package_name: &str) -> Result<ResolvedRepository, FetchError> {
    let parts: Vec<&str> = package_name.splitn(4, '/').collect();
    if parts.len() < 3 || parts[0] != "github.com" || parts[1].is_empty() || parts[2].is_empty() {
        return Err(FetchError::InvalidFormat(format!(
            "{}: invalid github package name",
            package_name
        )));
    }

    let module = format!("github.com/{}/{}", parts[1], parts[2]);
    Ok(ResolvedRepository {
        repository: format!("https://{}", module),
        module,
        vcs: "git".to_string(),
        rel_path: parts.get(3).map(|s| s.to_string()).unwrap_or_default(),
    })
}
