//! Package frontends
//!
//! A [`Frontend`] turns the definition of a package at a location into a
//! [`Package`]. The configuration language itself lives outside this crate;
//! [`JsonFrontend`] reads definitions that were already compiled to JSON.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::loader::PackageLoader;
use crate::module::Location;
use crate::schema::{Package, PackageDefinition, PackageName, PackageType};
use std::io::ErrorKind;

/// File holding a compiled package definition
pub const PACKAGE_DEFINITION_FILE: &str = "keel.package.json";

pub trait Frontend: Send + Sync {
    /// Parse the package at `location`. Loads of other packages go through
    /// `loader`.
    fn parse_package(&self, ctx: &Context, loader: &dyn PackageLoader, location: &Location) -> Result<Package>;

    /// Determine what kind of package `name` is without finalizing it.
    fn guess_package_type(&self, ctx: &Context, loader: &dyn PackageLoader, name: &PackageName) -> Result<PackageType>;
}

/// Reads `keel.package.json` from the package directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrontend;

impl JsonFrontend {
    fn read_definition(&self, location: &Location) -> Result<Option<PackageDefinition>> {
        let path = location.abs_path().join(PACKAGE_DEFINITION_FILE);

        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::bad_input(format!("failed to read {}: {}", path.display(), e))
                    .at(&location.package_name))
            }
        };

        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| Error::bad_input(format!("{}: {}", PACKAGE_DEFINITION_FILE, e)).at(&location.package_name))
    }
}

impl Frontend for JsonFrontend {
    fn parse_package(&self, ctx: &Context, _loader: &dyn PackageLoader, location: &Location) -> Result<Package> {
        ctx.check()?;

        match self.read_definition(location)? {
            Some(definition) => Ok(definition.into_package(location.clone())),
            None => Err(Error::bad_input(format!(
                "no package definition found, {} missing in {}",
                PACKAGE_DEFINITION_FILE,
                location.abs_path().display()
            ))
            .at(&location.package_name)),
        }
    }

    fn guess_package_type(&self, ctx: &Context, loader: &dyn PackageLoader, name: &PackageName) -> Result<PackageType> {
        let location = loader.resolve(ctx, name)?;

        match self.read_definition(&location)? {
            Some(definition) => Ok(definition.into_package(location).package_type()),
            None => Ok(PackageType::None),
        }
    }
}
