//! # skald-paths
//!
//! Canonical on-disk layout for the provisioner's code-module cache.
//!
//! Every path under the cache root is composed here and only here; the
//! other crates receive ready-made [`PathBuf`]s from a [`PathResolver`].
//! The layout is stable because downstream consumers (the CSI server and
//! the injection webhook) mount and address it by convention:
//!
//! ```text
//! <root>/
//!   codemodules/<key>/          # key = image digest hex or version string
//!   tenants/<uuid>/config/      # per-tenant active config tree
//!   tenants/<uuid>/ruxit.cache.json
//!   tmp/unzip/                  # extraction scratch, ephemeral
//!   cache/<digest>/             # OCI layout scratch, per-reconcile
//! ```

use std::path::{Path, PathBuf};

/// Mount point used when the provisioner runs as an init container and
/// writes the agent directly into the workload volume.
pub const INIT_BIN_MOUNT: &str = "/mnt/bin";

/// File name of the per-process SQLite install registry.
pub const STATE_DB_FILE: &str = "provisioner.db";

/// Pure mapping from the configured cache root to every path the
/// provisioner touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The configured cache root.
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// Per-resource working directory: `<root>/<name>`.
    pub fn resource_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Parent of all content-addressed artifacts: `<root>/codemodules`.
    pub fn agent_binary_base(&self) -> PathBuf {
        self.root.join("codemodules")
    }

    /// Artifact directory for one key: `<root>/codemodules/<key>`.
    pub fn agent_binary_dir(&self, key: &str) -> PathBuf {
        self.agent_binary_base().join(key)
    }

    /// Per-tenant active config tree: `<root>/tenants/<uuid>/config`.
    pub fn agent_config_dir(&self, tenant_uuid: &str) -> PathBuf {
        self.root.join("tenants").join(tenant_uuid).join("config")
    }

    /// Extraction scratch root: `<root>/tmp/unzip`.
    pub fn temp_unzip_root(&self) -> PathBuf {
        self.root.join("tmp").join("unzip")
    }

    /// Extraction scratch target: `<root>/tmp/unzip/agent`.
    pub fn temp_unzip_target(&self) -> PathBuf {
        self.temp_unzip_root().join("agent")
    }

    /// Per-tenant process-module config cache file:
    /// `<root>/tenants/<uuid>/ruxit.cache.json`.
    pub fn ruxit_cache_path(&self, tenant_uuid: &str) -> PathBuf {
        self.root
            .join("tenants")
            .join(tenant_uuid)
            .join("ruxit.cache.json")
    }

    /// Per-reconcile OCI layout scratch: `<root>/cache/<digest>`.
    ///
    /// Removed on every return path of an image install.
    pub fn image_cache_dir(&self, digest: &str) -> PathBuf {
        self.root.join("cache").join(digest)
    }

    /// Path of the SQLite install registry.
    pub fn state_db_path(&self) -> PathBuf {
        self.root.join(STATE_DB_FILE)
    }

    /// True when the root is the reserved init-container mount. In that
    /// mode extraction writes directly into the target directory and the
    /// already-present short cut is disabled.
    pub fn is_init_mount(&self) -> bool {
        self.root == Path::new(INIT_BIN_MOUNT)
    }
}
