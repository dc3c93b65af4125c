//! Agent installation from a digest-pinned container image.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use skald_paths::PathResolver;

use crate::archive::Extractor;
use crate::error::ProvisionError;
use crate::oci::layout::is_extractable_layer;
use crate::oci::{Platform, Reference, RegistryClient};
use crate::vfs::Vfs;

/// Pulls a code-module image and unpacks its layers into a digest-keyed
/// directory. The OCI layout cache built during the pull never outlives
/// the install.
pub struct ImageInstaller {
    vfs: Arc<dyn Vfs>,
    resolver: PathResolver,
    extractor: Extractor,
    client: RegistryClient,
    reference: Reference,
}

impl ImageInstaller {
    pub fn new(
        vfs: Arc<dyn Vfs>,
        resolver: PathResolver,
        client: RegistryClient,
        reference: Reference,
    ) -> Self {
        let extractor = Extractor::new(vfs.clone(), resolver.clone());
        ImageInstaller { vfs, resolver, extractor, client, reference }
    }

    /// Install into `target_dir`. Returns `false` without touching the
    /// network when the digest is already unpacked, `true` after a fresh
    /// pull.
    pub async fn install(&self, target_dir: &Path) -> Result<bool, ProvisionError> {
        if self.vfs.exists(target_dir) {
            info!(target = %target_dir.display(), "image already installed");
            return Ok(false);
        }
        info!(
            image = %self.reference,
            target = %target_dir.display(),
            "installing agent from image"
        );

        let cache_root = self.resolver.image_cache_dir(self.reference.key());
        let outcome = self.pull_and_extract(&cache_root, target_dir).await;
        if let Err(err) = self.vfs.remove_all(&cache_root) {
            warn!(
                cache = %cache_root.display(),
                error = %err,
                "failed to remove image layout cache"
            );
        }
        outcome?;
        Ok(true)
    }

    async fn pull_and_extract(
        &self,
        cache_root: &Path,
        target_dir: &Path,
    ) -> Result<(), ProvisionError> {
        let image = self.client.pull_manifest(&self.reference, &Platform::host()).await?;
        debug!(
            digest = %image.manifest_digest,
            layers = image.manifest.layers.len(),
            bytes = image.manifest.total_layer_size(),
            "resolved image manifest"
        );
        let layout_dir = cache_root.join(self.reference.digest());
        let layout = self
            .client
            .save_layout(self.vfs.as_ref(), &self.reference, &image, &layout_dir)
            .await?;

        let mut blobs = Vec::with_capacity(layout.layers().len());
        for layer in layout.layers() {
            if !is_extractable_layer(&layer.media_type) {
                return Err(ProvisionError::InvalidArchive(format!(
                    "layer {} has unsupported media type {}",
                    layer.digest, layer.media_type
                )));
            }
            blobs.push(layout.blob_path(&layer.digest));
        }
        self.extractor.extract_layers(&blobs, target_dir)?;
        Ok(())
    }
}
