//! Process-module configuration pipeline.
//!
//! Each tenant gets an on-disk cache of the last fetched configuration.
//! Fetches are conditional on the cached revision, the first merge
//! preserves the shipped `ruxitagentproc.conf` as an immutable baseline,
//! and every rendered config reaches its destination through a temp file
//! and rename.

use std::io::{self, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use skald_paths::PathResolver;
use skald_procconf::{merge_lines, CachedProcessModuleConfig, ProcessModuleConfig};

use crate::error::ProvisionError;
use crate::tenant::TenantApiClient;
use crate::vfs::Vfs;

/// Active config file inside an agent tree.
pub const AGENT_PROC_CONF: &str = "agent/conf/ruxitagentproc.conf";
/// Pristine copy taken before the first merge.
pub const AGENT_PROC_CONF_BASELINE: &str = "agent/conf/_ruxitagentproc.conf";

/// Per-tenant cache of the last fetched process-module config.
pub struct ConfigCache {
    vfs: Arc<dyn Vfs>,
    resolver: PathResolver,
}

impl ConfigCache {
    pub fn new(vfs: Arc<dyn Vfs>, resolver: PathResolver) -> Self {
        ConfigCache { vfs, resolver }
    }

    /// Stored entry for the tenant. A missing or unreadable cache file
    /// reads as revision zero; the next successful fetch rewrites it.
    pub fn read(&self, tenant_uuid: &str) -> CachedProcessModuleConfig {
        let path = self.resolver.ruxit_cache_path(tenant_uuid);
        let reader = match self.vfs.open(&path) {
            Ok(reader) => reader,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "unreadable config cache, starting from revision zero"
                    );
                }
                return CachedProcessModuleConfig::default();
            }
        };
        match serde_json::from_reader(reader) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "corrupt config cache, starting from revision zero"
                );
                CachedProcessModuleConfig::default()
            }
        }
    }

    pub fn write(
        &self,
        tenant_uuid: &str,
        cached: &CachedProcessModuleConfig,
    ) -> Result<(), ProvisionError> {
        let path = self.resolver.ruxit_cache_path(tenant_uuid);
        if let Some(parent) = path.parent() {
            self.vfs.mkdir_all(parent, 0o755)?;
        }
        let body = serde_json::to_vec(cached)?;
        let temp = path.with_extension("json.tmp");
        let mut writer = self.vfs.create(&temp, 0o644)?;
        writer.write_all(&body)?;
        writer.flush()?;
        drop(writer);
        self.vfs.rename(&temp, &path)?;
        Ok(())
    }
}

/// Current config and its persisted hash, refreshing the cache when the
/// tenant holds a newer revision.
pub async fn fetch_process_module_config(
    cache: &ConfigCache,
    client: &TenantApiClient,
    tenant_uuid: &str,
) -> Result<(ProcessModuleConfig, String), ProvisionError> {
    let cached = cache.read(tenant_uuid);
    match client.get_process_module_config(cached.config.revision).await? {
        Some(config) => {
            let fresh = CachedProcessModuleConfig::new(config);
            cache.write(tenant_uuid, &fresh)?;
            debug!(revision = fresh.config.revision, "process-module config refreshed");
            Ok((fresh.config, fresh.hash))
        }
        None => {
            debug!(revision = cached.config.revision, "process-module config unchanged");
            Ok((cached.config, cached.hash))
        }
    }
}

/// Copy the shipped `ruxitagentproc.conf` to its baseline sibling, once
/// per target directory. Merges always read the baseline afterwards.
pub fn prepare_baseline(vfs: &dyn Vfs, target_dir: &Path) -> Result<(), ProvisionError> {
    let baseline = target_dir.join(AGENT_PROC_CONF_BASELINE);
    if vfs.exists(&baseline) {
        return Ok(());
    }
    let source = target_dir.join(AGENT_PROC_CONF);
    let mode = vfs.stat(&source)?.mode;
    let mut reader = vfs.open(&source)?;
    let mut writer = vfs.create(&baseline, mode)?;
    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    debug!(baseline = %baseline.display(), "preserved config baseline");
    Ok(())
}

/// Render the baseline of `source_dir` plus the override properties into
/// `dest`, keeping the baseline's file mode.
pub fn deploy_config(
    vfs: &dyn Vfs,
    source_dir: &Path,
    dest: &Path,
    config: &ProcessModuleConfig,
) -> Result<(), ProvisionError> {
    prepare_baseline(vfs, source_dir)?;
    let baseline = source_dir.join(AGENT_PROC_CONF_BASELINE);
    let mode = vfs.stat(&baseline)?.mode;
    let reader = BufReader::new(vfs.open(&baseline)?);
    let lines = merge_lines(reader, &config.to_map())?;

    if let Some(parent) = dest.parent() {
        vfs.mkdir_all(parent, 0o755)?;
    }
    let temp = dest.with_extension("conf.tmp");
    let mut writer = vfs.create(&temp, mode)?;
    for line in &lines {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    drop(writer);
    vfs.rename(&temp, dest)?;
    debug!(dest = %dest.display(), revision = config.revision, "deployed process-module config");
    Ok(())
}
