use std::path::Path;

use log::info;
use refit_platform::RootPaths;

use crate::error::UpdateError;
use crate::exclusion::ExclusionRules;
use crate::manifest::ManifestBuilder;
use crate::version::{VersionDescriptor, VersionStore, parse_version};

/// Publish the tree at `source` as `version`: write the manifest cache, then
/// the descriptor, so clients never see a descriptor without its manifest.
///
/// # Errors
/// Returns [`UpdateError::InvalidVersion`] for a malformed version or one
/// that is not newer than the version already published, and manifest or
/// I/O errors otherwise.
pub fn publish(
    source: &Path,
    version: &str,
    release_notes: &str,
    rules: &ExclusionRules,
) -> Result<VersionDescriptor, UpdateError> {
    let parsed = parse_version(version)?;
    if let Some(current) = VersionStore::read(source)?
        && !VersionStore::is_newer(version, &current.version)
    {
        return Err(UpdateError::invalid_version(
            version,
            format!("must be newer than published version {}", current.version),
        ));
    }

    let manifest = ManifestBuilder::build(source, rules)?;
    manifest.save_cache(&RootPaths::new(source).manifest_cache_file())?;

    let descriptor = VersionDescriptor::new(parsed.to_string(), release_notes);
    VersionStore::write(source, &descriptor)?;
    info!(
        "Published {} from {} ({} files, {} bytes)",
        descriptor.version,
        source.display(),
        manifest.len(),
        manifest.total_bytes()
    );
    Ok(descriptor)
}
