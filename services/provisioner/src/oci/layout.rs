//! OCI wire types and the on-disk image layout.
//!
//! The image installer saves a pulled image as a standard OCI image layout
//! (`oci-layout` + `index.json` + `blobs/<alg>/<hex>`) inside a short-lived
//! scratch directory, then extracts the layer blobs from it. Only gzip
//! tarball layer types are extractable; anything else fails the install
//! rather than being skipped.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::vfs::Vfs;

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

const LAYOUT_MARKER_FILE: &str = "oci-layout";
const LAYOUT_INDEX_FILE: &str = "index.json";
const LAYOUT_BLOBS_DIR: &str = "blobs";
const LAYOUT_VERSION: &str = "1.0.0";

pub fn is_image_index(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

pub fn is_image_manifest(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

/// Whether a layer of this media type can be unpacked as `tar+gzip`.
pub fn is_extractable_layer(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_LAYER_GZIP || media_type == MEDIA_TYPE_DOCKER_LAYER_GZIP
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// Image manifest: one config blob plus ordered layer blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|layer| layer.size).sum()
    }
}

/// Platform selector used against multi-arch indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    /// `linux` plus the architecture of this build target.
    pub fn host() -> Self {
        let architecture = if cfg!(target_arch = "aarch64") {
            "arm64"
        } else {
            "amd64"
        };
        Platform {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
        }
    }

    pub fn matches(&self, other: &Platform) -> bool {
        self.os == other.os && self.architecture == other.architecture
    }
}

/// One entry of a multi-arch image index.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    #[serde(default)]
    pub media_type: Option<String>,
    pub digest: String,
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// Multi-arch image index (OCI index / docker manifest list).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub manifests: Vec<IndexEntry>,
}

impl ImageIndex {
    /// Digest of the manifest matching `platform`, if any.
    pub fn select(&self, platform: &Platform) -> Option<&str> {
        self.manifests
            .iter()
            .find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .is_some_and(|candidate| candidate.matches(platform))
            })
            .map(|entry| entry.digest.as_str())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker {
    image_layout_version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LayoutIndex {
    schema_version: u32,
    manifests: Vec<Descriptor>,
}

/// A saved OCI image layout on a [`Vfs`].
#[derive(Debug, Clone)]
pub struct ImageLayout {
    dir: PathBuf,
    manifest: Manifest,
}

impl ImageLayout {
    /// Write the layout skeleton: marker, index, and the manifest blob.
    /// Blob payloads (config, layers) are pulled in afterwards by the
    /// registry client.
    pub fn init(
        vfs: &dyn Vfs,
        dir: &Path,
        manifest: Manifest,
        manifest_digest: &str,
        manifest_bytes: &[u8],
    ) -> io::Result<Self> {
        vfs.mkdir_all(dir, 0o755)?;

        let marker = serde_json::to_vec(&LayoutMarker {
            image_layout_version: LAYOUT_VERSION,
        })?;
        write_file(vfs, &dir.join(LAYOUT_MARKER_FILE), &marker)?;

        let media_type = manifest
            .media_type
            .clone()
            .unwrap_or_else(|| MEDIA_TYPE_OCI_MANIFEST.to_string());
        let index = serde_json::to_vec(&LayoutIndex {
            schema_version: 2,
            manifests: vec![Descriptor {
                media_type,
                digest: manifest_digest.to_string(),
                size: manifest_bytes.len() as u64,
            }],
        })?;
        write_file(vfs, &dir.join(LAYOUT_INDEX_FILE), &index)?;

        let layout = ImageLayout {
            dir: dir.to_path_buf(),
            manifest,
        };
        let manifest_path = layout.blob_path(manifest_digest);
        if let Some(parent) = manifest_path.parent() {
            vfs.mkdir_all(parent, 0o755)?;
        }
        write_file(vfs, &manifest_path, manifest_bytes)?;
        Ok(layout)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn layers(&self) -> &[Descriptor] {
        &self.manifest.layers
    }

    /// Path of a blob inside the layout, `blobs/<alg>/<hex>`.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        match digest.split_once(':') {
            Some((algorithm, hex)) => self.dir.join(LAYOUT_BLOBS_DIR).join(algorithm).join(hex),
            None => self.dir.join(LAYOUT_BLOBS_DIR).join(digest),
        }
    }
}

fn write_file(vfs: &dyn Vfs, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut writer = vfs.create(path, 0o644)?;
    writer.write_all(bytes)?;
    writer.flush()
}
