//! Agent installation from the tenant deployment API.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use skald_paths::PathResolver;

use crate::archive::Extractor;
use crate::error::ProvisionError;
use crate::tenant::{InstallerProperties, TenantApiClient, TenantApiError};
use crate::vfs::Vfs;

use super::symlink::create_current_symlink;
use super::DOWNLOAD_FILE;

/// Sentinel version resolved by the tenant to its newest agent.
pub const VERSION_LATEST: &str = "latest";

/// What to download in URL mode.
#[derive(Debug, Clone, Default)]
pub struct AgentSource {
    /// Version string, possibly [`VERSION_LATEST`].
    pub version: String,
    /// Fully specified download URL; takes precedence over `version`.
    pub installer_url: Option<String>,
    /// Technology filters forwarded to the deployment API.
    pub technologies: Vec<String>,
}

/// Downloads an agent zip and unpacks it into a version-keyed directory.
pub struct UrlInstaller<'a> {
    vfs: Arc<dyn Vfs>,
    resolver: PathResolver,
    extractor: Extractor,
    client: &'a TenantApiClient,
    source: AgentSource,
}

impl<'a> UrlInstaller<'a> {
    pub fn new(
        vfs: Arc<dyn Vfs>,
        resolver: PathResolver,
        client: &'a TenantApiClient,
        source: AgentSource,
    ) -> Self {
        let extractor = Extractor::new(vfs.clone(), resolver.clone());
        UrlInstaller { vfs, resolver, extractor, client, source }
    }

    /// Install into `target_dir`. Returns `true` both for a fresh install
    /// and when the agent was already in place.
    pub async fn install(&self, target_dir: &Path) -> Result<bool, ProvisionError> {
        if self.vfs.exists(target_dir) && !self.resolver.is_init_mount() {
            info!(target = %target_dir.display(), "agent already installed");
            return Ok(true);
        }
        info!(
            version = %self.source.version,
            target = %target_dir.display(),
            "installing agent from tenant api"
        );

        self.vfs.mkdir_all(&self.resolver.agent_binary_base(), 0o755)?;
        let download_path = self.download_path(target_dir)?;

        let outcome = self.download_and_extract(&download_path, target_dir).await;
        let _ = self.vfs.remove(&download_path);
        outcome?;
        Ok(true)
    }

    /// The download lands next to the target, or inside it when the target
    /// is the init-container mount.
    fn download_path(&self, target_dir: &Path) -> Result<PathBuf, ProvisionError> {
        let dir = if self.resolver.is_init_mount() {
            self.vfs.mkdir_all(target_dir, 0o755)?;
            target_dir.to_path_buf()
        } else {
            target_dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.resolver.agent_binary_base())
        };
        Ok(dir.join(DOWNLOAD_FILE))
    }

    async fn download_and_extract(
        &self,
        download_path: &Path,
        target_dir: &Path,
    ) -> Result<(), ProvisionError> {
        {
            let mut sink = self.vfs.create(download_path, 0o644)?;
            self.download(&mut *sink).await?;
            sink.flush()?;
        }

        let archive = self.vfs.open(download_path)?;
        if let Err(err) = self.extractor.extract_zip(archive, target_dir) {
            let _ = self.vfs.remove_all(target_dir);
            return Err(err);
        }
        create_current_symlink(self.vfs.as_ref(), target_dir)?;
        Ok(())
    }

    async fn download(&self, sink: &mut (dyn Write + Send)) -> Result<(), ProvisionError> {
        if let Some(url) = &self.source.installer_url {
            self.client.get_agent_via_installer_url(url, sink).await?;
            return Ok(());
        }

        let props = InstallerProperties::for_technologies(&self.source.technologies);
        if self.source.version == VERSION_LATEST {
            self.client.get_latest_agent(&props, sink).await?;
            return Ok(());
        }

        debug!(version = %self.source.version, "downloading pinned agent version");
        if let Err(err) = self.client.get_agent(&props, &self.source.version, sink).await {
            return Err(self.version_error(err, &props).await);
        }
        Ok(())
    }

    /// A pinned version that the tenant refuses is reported together with
    /// the versions it does offer.
    async fn version_error(
        &self,
        err: TenantApiError,
        props: &InstallerProperties,
    ) -> ProvisionError {
        match self.client.get_agent_versions(&props.os, &props.installer_type).await {
            Ok(versions) if !versions.is_empty() => ProvisionError::NotFound(format!(
                "failed to fetch agent version {}: {}, available versions are: [ {} ]",
                self.source.version,
                err,
                versions.join(" , ")
            )),
            _ => err.into(),
        }
    }
}
