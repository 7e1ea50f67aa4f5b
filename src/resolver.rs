//! Collaborator contracts
//!
//! The cache has no knowledge of how artifacts are produced. Embedders plug in
//! an `ArtifactResolver` (used for hydration and reconstruction) and optionally
//! a `Describer` that derives a notation tag from reference paths.

use anyhow::Result;

use crate::entry::ArtifactHandle;

/// Materializes a single reference path into an artifact handle
///
/// `Ok(None)` means the path is unknown to the resolver. Errors are logged by
/// the cache and treated the same as `Ok(None)`.
pub trait ArtifactResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Result<Option<ArtifactHandle>>;
}

impl<F> ArtifactResolver for F
where
    F: Fn(&str) -> Result<Option<ArtifactHandle>> + Send + Sync,
{
    fn resolve(&self, path: &str) -> Result<Option<ArtifactHandle>> {
        self(path)
    }
}

/// Produces a descriptive notation for a list of reference paths
pub trait Describer: Send + Sync {
    fn describe(&self, reference_paths: &[String]) -> Result<String>;
}

impl<F> Describer for F
where
    F: Fn(&[String]) -> Result<String> + Send + Sync,
{
    fn describe(&self, reference_paths: &[String]) -> Result<String> {
        self(reference_paths)
    }
}
