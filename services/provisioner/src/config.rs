//! Configuration for the provisioner.

use anyhow::Result;

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the provisioner data volume.
    pub root_dir: String,

    /// Directory the file-backed object store reads manifests from.
    pub manifest_dir: String,

    /// Namespace filter; `None` watches all namespaces.
    pub namespace: Option<String>,

    /// Seconds between object store sweeps.
    pub sync_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Settings {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let root_dir = std::env::var("SKALD_ROOT_DIR").unwrap_or_else(|_| "/data".to_string());

        let manifest_dir = std::env::var("SKALD_MANIFEST_DIR")
            .unwrap_or_else(|_| "/etc/skald/manifests".to_string());

        let namespace = std::env::var("SKALD_NAMESPACE")
            .ok()
            .filter(|namespace| !namespace.is_empty());

        let sync_interval_secs = std::env::var("SKALD_SYNC_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let log_level = std::env::var("SKALD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            root_dir,
            manifest_dir,
            namespace,
            sync_interval_secs,
            log_level,
        })
    }
}
