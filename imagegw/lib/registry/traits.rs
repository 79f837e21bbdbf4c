use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::GatewayResult;

use super::VerifiedManifest;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A registry images can be pulled from.
#[async_trait]
pub trait RegistryPull: Send + Sync {
    /// Fetches and verifies the manifest of `repository:tag`.
    async fn fetch_manifest(&self, repository: &str, tag: &str)
        -> GatewayResult<VerifiedManifest>;

    /// Downloads a layer blob into `cache_dir` and returns its path.
    ///
    /// Returns `None` for deny-listed blobs, which are skipped entirely.
    async fn fetch_layer(
        &self,
        repository: &str,
        digest: &str,
        cache_dir: &Path,
    ) -> GatewayResult<Option<PathBuf>>;

    /// Returns true once private credentials were used to access the registry.
    fn is_private(&self) -> bool;
}
