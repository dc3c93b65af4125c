//! OCI distribution client.
//!
//! Pulls digest-pinned manifests and blobs over the distribution API and
//! saves them as an on-disk image layout. Every payload is verified against
//! its digest before use; a multi-arch index is narrowed to one platform
//! before layers are touched. Credentials come from the pull-secret
//! keychain and go out as HTTP Basic per registry host.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use reqwest::{header, Client, Response, StatusCode};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::credentials::DockerKeychain;
use crate::vfs::Vfs;

use super::layout::{
    is_extractable_layer, is_image_index, is_image_manifest, ImageIndex, ImageLayout, Manifest,
    Platform, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
};
use super::{OciError, Reference};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Transport settings for registry access.
#[derive(Debug, Clone, Default)]
pub struct RegistryClientConfig {
    pub keychain: DockerKeychain,
    /// Extra PEM roots appended to the trust store.
    pub ca_bundle: Option<Vec<u8>>,
    pub skip_cert_check: bool,
    pub proxy_url: Option<String>,
    pub timeout: Option<Duration>,
}

/// A platform-resolved image manifest plus its verified raw bytes.
#[derive(Debug, Clone)]
pub struct PulledImage {
    pub manifest: Manifest,
    /// Digest of the resolved manifest, `sha256:<hex>`.
    pub manifest_digest: String,
    pub manifest_bytes: Vec<u8>,
}

/// Client for the OCI distribution API.
pub struct RegistryClient {
    config: RegistryClientConfig,
    client: Client,
}

impl RegistryClient {
    pub fn new(config: RegistryClientConfig) -> Result<Self, OciError> {
        let mut builder = Client::builder().timeout(config.timeout.unwrap_or(DEFAULT_TIMEOUT));
        if config.skip_cert_check {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &config.ca_bundle {
            for cert in reqwest::Certificate::from_pem_bundle(pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        if let Some(proxy) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;

        Ok(RegistryClient { config, client })
    }

    /// Resolve `reference` to a single-platform manifest, following one
    /// level of multi-arch index indirection.
    pub async fn pull_manifest(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> Result<PulledImage, OciError> {
        let (bytes, digest) = self.fetch_verified_manifest(reference, &reference.digest()).await?;

        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let media_type = value
            .get("mediaType")
            .and_then(|media| media.as_str())
            .unwrap_or_default();

        if value.get("manifests").is_some() || is_image_index(media_type) {
            let index: ImageIndex = serde_json::from_slice(&bytes)?;
            let selected = index.select(platform).ok_or_else(|| OciError::NoPlatformMatch {
                os: platform.os.clone(),
                arch: platform.architecture.clone(),
            })?;
            debug!(
                index = %digest,
                manifest = %selected,
                os = %platform.os,
                arch = %platform.architecture,
                "resolved platform manifest from index"
            );
            let selected = selected.to_string();
            let (bytes, digest) = self.fetch_verified_manifest(reference, &selected).await?;
            let manifest: Manifest = serde_json::from_slice(&bytes)?;
            return Ok(PulledImage {
                manifest,
                manifest_digest: digest,
                manifest_bytes: bytes,
            });
        }

        if !media_type.is_empty() && !is_image_manifest(media_type) {
            return Err(OciError::Api {
                status: 200,
                message: format!("unexpected manifest media type {media_type}"),
            });
        }
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        Ok(PulledImage {
            manifest,
            manifest_digest: digest,
            manifest_bytes: bytes,
        })
    }

    /// Download one blob into `dest` on `vfs`, verifying its digest.
    /// Writes go through a sibling temp file and finish with a rename.
    pub async fn pull_blob(
        &self,
        reference: &Reference,
        digest: &str,
        vfs: &dyn Vfs,
        dest: &Path,
    ) -> Result<u64, OciError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            reference.registry_url(),
            reference.repository(),
            digest
        );
        debug!(url = %url, dest = %dest.display(), "pulling blob");

        let response = self.authorized_get(reference, &url).send().await?;
        let mut response = self.ensure_success(reference, response).await?;

        if let Some(parent) = dest.parent() {
            vfs.mkdir_all(parent, 0o755)?;
        }
        let temp_path = dest.with_extension("tmp");
        let mut sink = vfs.create(&temp_path, 0o644)?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            sink.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        sink.flush()?;
        drop(sink);

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != digest {
            let _ = vfs.remove(&temp_path);
            return Err(OciError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }
        vfs.rename(&temp_path, dest)?;

        debug!(digest = %digest, size = written, "blob downloaded");
        Ok(written)
    }

    /// Save a pulled image as an OCI layout at `dir`: metadata files plus
    /// the config and every layer blob.
    pub async fn save_layout(
        &self,
        vfs: &dyn Vfs,
        reference: &Reference,
        image: &PulledImage,
        dir: &Path,
    ) -> Result<ImageLayout, OciError> {
        let layout = ImageLayout::init(
            vfs,
            dir,
            image.manifest.clone(),
            &image.manifest_digest,
            &image.manifest_bytes,
        )?;

        let config_digest = layout.manifest().config.digest.clone();
        self.pull_blob(reference, &config_digest, vfs, &layout.blob_path(&config_digest))
            .await?;

        for layer in layout.layers().to_vec() {
            // Unsupported layer types fail later at extraction; their bytes
            // still belong in a complete layout.
            if !is_extractable_layer(&layer.media_type) {
                debug!(
                    digest = %layer.digest,
                    media_type = %layer.media_type,
                    "saving non-extractable layer blob"
                );
            }
            self.pull_blob(reference, &layer.digest, vfs, &layout.blob_path(&layer.digest))
                .await?;
        }
        Ok(layout)
    }

    async fn fetch_verified_manifest(
        &self,
        reference: &Reference,
        digest: &str,
    ) -> Result<(Vec<u8>, String), OciError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            reference.registry_url(),
            reference.repository(),
            digest
        );
        debug!(url = %url, "pulling manifest");

        let accept = [
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        ]
        .join(", ");
        let response = self
            .authorized_get(reference, &url)
            .header(header::ACCEPT, accept)
            .send()
            .await?;
        let response = self.ensure_success(reference, response).await?;
        let bytes = response.bytes().await?.to_vec();

        let computed = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
        if computed != digest {
            return Err(OciError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }
        Ok((bytes, computed))
    }

    fn authorized_get(&self, reference: &Reference, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match self.config.keychain.auth_for(reference.host()) {
            Some(auth) => request.basic_auth(auth.username, Some(auth.password)),
            None => request,
        }
    }

    async fn ensure_success(
        &self,
        reference: &Reference,
        response: Response,
    ) -> Result<Response, OciError> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(OciError::NotFound(reference.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(OciError::AuthRequired(reference.host().to_string()))
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(OciError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}
