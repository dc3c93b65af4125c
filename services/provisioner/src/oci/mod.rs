//! OCI registry access for image-based agent delivery.
//!
//! Split into reference parsing (here), wire types and the on-disk image
//! layout ([`layout`]), and the registry client ([`client`]). Code-module
//! images are always digest-pinned; tag-only references are rejected before
//! any network traffic happens.

use std::fmt;

use thiserror::Error;

pub mod client;
pub mod layout;

pub use client::{PulledImage, RegistryClient, RegistryClientConfig};
pub use layout::{Descriptor, ImageLayout, Manifest, Platform};

/// Registry host used when a reference names none.
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// Errors from OCI operations.
#[derive(Debug, Error)]
pub enum OciError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("not found in registry: {0}")]
    NotFound(String),

    #[error("registry authentication failed for {0}")]
    AuthRequired(String),

    #[error("no manifest for platform {os}/{arch}")]
    NoPlatformMatch { os: String, arch: String },

    #[error("registry returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// A digest-pinned image reference.
///
/// `host/repository@sha256:<hex>`; an interleaved tag is tolerated and
/// ignored. Hub-style short names are normalised the way docker does it:
/// `alpine@...` becomes `registry-1.docker.io/library/alpine@...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    host: String,
    repository: String,
    digest_hex: String,
}

impl Reference {
    pub fn parse(raw: &str) -> Result<Self, OciError> {
        let (name, digest) = raw.rsplit_once('@').ok_or_else(|| {
            OciError::InvalidReference(format!("digest-pinned reference required: {raw}"))
        })?;
        let digest_hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| {
                OciError::InvalidReference(format!("unsupported digest algorithm in {raw}"))
            })?
            .to_string();
        if digest_hex.len() != 64
            || !digest_hex
                .bytes()
                .all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(OciError::InvalidReference(format!(
                "malformed sha256 digest in {raw}"
            )));
        }

        let name = strip_tag(name);
        if name.is_empty() {
            return Err(OciError::InvalidReference(format!("empty image name in {raw}")));
        }

        let parts: Vec<&str> = name.splitn(2, '/').collect();
        let (host, repository) = if parts.len() == 1 {
            (DOCKER_HUB_REGISTRY.to_string(), format!("library/{}", parts[0]))
        } else if parts[0].contains('.') || parts[0].contains(':') || parts[0] == "localhost" {
            (parts[0].to_string(), parts[1].to_string())
        } else {
            (DOCKER_HUB_REGISTRY.to_string(), name.clone())
        };
        if repository.is_empty() {
            return Err(OciError::InvalidReference(format!("empty repository in {raw}")));
        }

        Ok(Reference {
            host,
            repository,
            digest_hex,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Full digest string, `sha256:<hex>`.
    pub fn digest(&self) -> String {
        format!("sha256:{}", self.digest_hex)
    }

    /// Cache key for the artifact directory: the bare digest hex.
    pub fn key(&self) -> &str {
        &self.digest_hex
    }

    /// Registry endpoint base. Loopback hosts go plaintext so local
    /// registries and test servers work without certificates.
    pub fn registry_url(&self) -> String {
        if self.host.starts_with("localhost") || self.host.starts_with("127.") {
            format!("http://{}", self.host)
        } else {
            format!("https://{}", self.host)
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.host, self.repository, self.digest())
    }
}

fn strip_tag(name: &str) -> String {
    match name.rsplit_once('/') {
        Some((head, last)) => match last.split_once(':') {
            Some((repo, _tag)) => format!("{head}/{repo}"),
            None => name.to_string(),
        },
        None => match name.split_once(':') {
            Some((bare, _tag)) => bare.to_string(),
            None => name.to_string(),
        },
    }
}
