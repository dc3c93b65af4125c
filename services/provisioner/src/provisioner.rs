//! Reconciler and controller loop for AgentCluster resources.
//!
//! The loop polls the object store, keeps a per-key schedule, and runs one
//! reconcile at a time. A reconcile converges one resource: directory
//! skeleton, tenant client, process-module config, code-module install,
//! merged agent config, status echo. Install events fire only when an
//! install was actually attempted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use skald_paths::PathResolver;
use skald_reconcile::{Backoff, Outcome, Schedule};

use crate::credentials;
use crate::error::ProvisionError;
use crate::events::{EventSink, InstallEvent};
use crate::installer::{AgentSource, ImageInstaller, UrlInstaller};
use crate::oci::{Reference, RegistryClient, RegistryClientConfig};
use crate::pmc::{self, ConfigCache, AGENT_PROC_CONF};
use crate::resource::{AgentCluster, CodeModulesStatus};
use crate::state::{InstallRecord, StateStore};
use crate::store::{ObjectStore, StoreError};
use crate::tenant::{TenantApiClient, TenantClientConfig};
use crate::vfs::Vfs;

/// Requeue when the resource is not yet installable.
pub const SHORT_REQUEUE: Duration = Duration::from_secs(60);
/// Requeue after a successful install pass.
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(5 * 60);
/// Requeue when code-module injection is disabled.
pub const LONG_REQUEUE: Duration = Duration::from_secs(30 * 60);

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// Loop options.
#[derive(Debug, Clone)]
pub struct ProvisionerOptions {
    /// Namespace filter; `None` watches all namespaces.
    pub namespace: Option<String>,
    /// Interval between object store sweeps.
    pub sync_interval: Duration,
}

impl Default for ProvisionerOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            sync_interval: Duration::from_secs(30),
        }
    }
}

/// What one reconcile installed, or found already installed.
struct InstallSummary {
    /// Cache key: version string or digest hex.
    key: String,
    /// Full digest for image installs.
    image_digest: Option<String>,
    /// Version string for URL installs.
    latest_version: Option<String>,
    /// Whether an installer actually ran.
    fresh: bool,
}

/// Converges AgentCluster resources onto the data volume.
pub struct Provisioner {
    store: Arc<dyn ObjectStore>,
    vfs: Arc<dyn Vfs>,
    events: Arc<dyn EventSink>,
    resolver: PathResolver,
    registry: Mutex<StateStore>,
    options: ProvisionerOptions,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        vfs: Arc<dyn Vfs>,
        events: Arc<dyn EventSink>,
        resolver: PathResolver,
        registry: StateStore,
        options: ProvisionerOptions,
    ) -> Self {
        Provisioner {
            store,
            vfs,
            events,
            resolver,
            registry: Mutex::new(registry),
            options,
        }
    }

    /// Run the provisioning loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sync_interval_secs = self.options.sync_interval.as_secs(),
            namespace = self.options.namespace.as_deref().unwrap_or("<all>"),
            "starting provisioning loop"
        );

        let mut sync_interval = tokio::time::interval(self.options.sync_interval);
        let mut schedule = Schedule::new();
        let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_CAP);

        loop {
            tokio::select! {
                _ = sync_interval.tick() => {
                    self.sync_clusters(&mut schedule).await;
                    self.drain_due(&mut schedule, &mut backoff).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("provisioner shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Track every listed resource; new keys become due immediately.
    async fn sync_clusters(&self, schedule: &mut Schedule) {
        match self.store.list_agent_clusters(self.options.namespace.as_deref()).await {
            Ok(clusters) => {
                for cluster in clusters {
                    let key = format!("{}/{}", cluster.namespace(), cluster.name());
                    if !schedule.contains(&key) {
                        debug!(resource = %key, "tracking resource");
                        schedule.set(&key, Instant::now());
                    }
                }
            }
            Err(err) => warn!(error = %err, "listing resources failed"),
        }
    }

    /// Reconcile every due key, one at a time.
    async fn drain_due(&self, schedule: &mut Schedule, backoff: &mut Backoff) {
        for key in schedule.drain_due(Instant::now()) {
            let Some((namespace, name)) = key.split_once('/') else {
                continue;
            };
            match self.reconcile(namespace, name).await {
                Ok(outcome) => {
                    backoff.reset(&key);
                    match outcome.requeue_after {
                        Some(delay) => schedule.set(&key, Instant::now() + delay),
                        None => debug!(resource = %key, "resource dropped from schedule"),
                    }
                }
                Err(err) => {
                    let delay = backoff.next_delay(&key);
                    error!(
                        resource = %key,
                        error = %err,
                        retry_in_secs = delay.as_secs(),
                        "reconcile failed"
                    );
                    schedule.set(&key, Instant::now() + delay);
                }
            }
        }
    }

    /// Converge one resource.
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Outcome, ProvisionError> {
        let cluster = match self.store.get_agent_cluster(namespace, name).await {
            Ok(cluster) => cluster,
            Err(StoreError::NotFound(_)) => {
                info!(resource = %name, "resource gone, dropping install record");
                self.registry.lock().await.delete_install(name)?;
                return Ok(Outcome::done());
            }
            Err(err) => return Err(err.into()),
        };

        self.vfs.mkdir_all(&self.resolver.resource_dir(name), 0o755)?;
        self.vfs.mkdir_all(&self.resolver.agent_binary_base(), 0o755)?;

        if !cluster.needs_injection() {
            debug!(resource = %name, "code-module injection disabled");
            return Ok(Outcome::requeue_after(LONG_REQUEUE));
        }

        let code_modules = &cluster.spec.code_modules;
        let has_image = code_modules.image.as_deref().is_some_and(|s| !s.is_empty());
        let has_version = code_modules.version.as_deref().is_some_and(|s| !s.is_empty());
        if !has_image && !has_version {
            info!(resource = %name, "no code-module version or image yet");
            return Ok(Outcome::requeue_after(SHORT_REQUEUE));
        }

        let tenant_uuid = cluster.tenant_uuid()?;
        let tokens = credentials::read_tokens(self.store.as_ref(), &cluster).await?;
        let ca_bundle = credentials::read_trusted_cas(self.store.as_ref(), &cluster).await?;
        let proxy_url = credentials::read_proxy_url(self.store.as_ref(), &cluster).await?;

        let mut tenant_config =
            TenantClientConfig::new(&cluster.spec.api_url, &tokens.api_token, &tokens.paas_token);
        tenant_config.network_zone = cluster.spec.network_zone.clone();
        tenant_config.host_group = cluster.spec.host_group.clone();
        tenant_config.skip_cert_check = cluster.spec.skip_cert_check;
        tenant_config.ca_bundle = ca_bundle.clone();
        tenant_config.proxy_url = proxy_url.clone();
        let client = TenantApiClient::new(tenant_config)?;

        let cache = ConfigCache::new(self.vfs.clone(), self.resolver.clone());
        let (mut config, hash) =
            pmc::fetch_process_module_config(&cache, &client, &tenant_uuid).await?;
        debug!(tenant = %tenant_uuid, hash = %hash, "process-module config resolved");

        let summary = if has_image {
            self.install_from_image(&cluster, &tenant_uuid, ca_bundle, proxy_url).await?
        } else {
            self.install_from_url(&cluster, &tenant_uuid, &client).await?
        };

        config.add_host_group(cluster.spec.host_group.as_deref().unwrap_or_default());
        let target_dir = self.resolver.agent_binary_dir(&summary.key);
        let dest = self.resolver.agent_config_dir(&tenant_uuid).join(AGENT_PROC_CONF);
        pmc::deploy_config(self.vfs.as_ref(), &target_dir, &dest, &config)?;

        if summary.fresh {
            let record = InstallRecord {
                name: cluster.name().to_string(),
                tenant_uuid: tenant_uuid.clone(),
                latest_version: summary.latest_version.clone(),
                image_digest: summary.image_digest.clone(),
                updated_at: Utc::now().to_rfc3339(),
            };
            self.registry.lock().await.upsert_install(&record)?;
        }
        self.echo_status(&cluster, &summary.key).await;

        Ok(Outcome::requeue_after(DEFAULT_REQUEUE))
    }

    async fn install_from_image(
        &self,
        cluster: &AgentCluster,
        tenant_uuid: &str,
        ca_bundle: Option<Vec<u8>>,
        proxy_url: Option<String>,
    ) -> Result<InstallSummary, ProvisionError> {
        let image = cluster.spec.code_modules.image.clone().unwrap_or_default();
        let reference = Reference::parse(&image)?;
        let key = reference.key().to_string();
        let digest = reference.digest();

        let target_dir = self.resolver.agent_binary_dir(&key);
        if self.is_already_present(&target_dir) {
            debug!(target = %target_dir.display(), "code modules already present");
            return Ok(InstallSummary {
                key,
                image_digest: Some(digest),
                latest_version: None,
                fresh: false,
            });
        }

        let keychain = credentials::read_pull_secret(self.store.as_ref(), cluster).await?;
        let registry = RegistryClient::new(RegistryClientConfig {
            keychain,
            ca_bundle,
            skip_cert_check: cluster.spec.skip_cert_check,
            proxy_url,
            timeout: None,
        })?;
        let installer =
            ImageInstaller::new(self.vfs.clone(), self.resolver.clone(), registry, reference);

        self.attempt(cluster, &key, tenant_uuid, installer.install(&target_dir)).await?;
        Ok(InstallSummary {
            key,
            image_digest: Some(digest),
            latest_version: None,
            fresh: true,
        })
    }

    async fn install_from_url(
        &self,
        cluster: &AgentCluster,
        tenant_uuid: &str,
        client: &TenantApiClient,
    ) -> Result<InstallSummary, ProvisionError> {
        let code_modules = &cluster.spec.code_modules;
        let version = code_modules.version.clone().unwrap_or_default();

        let target_dir = self.resolver.agent_binary_dir(&version);
        if self.is_already_present(&target_dir) {
            debug!(target = %target_dir.display(), "code modules already present");
            return Ok(InstallSummary {
                key: version.clone(),
                image_digest: None,
                latest_version: Some(version),
                fresh: false,
            });
        }

        let source = AgentSource {
            version: version.clone(),
            installer_url: code_modules.installer_url.clone(),
            technologies: code_modules.technologies.clone(),
        };
        let installer =
            UrlInstaller::new(self.vfs.clone(), self.resolver.clone(), client, source);

        self.attempt(cluster, &version, tenant_uuid, installer.install(&target_dir)).await?;
        Ok(InstallSummary {
            key: version.clone(),
            image_digest: None,
            latest_version: Some(version),
            fresh: true,
        })
    }

    /// Run an installer and emit the matching install event. Events are
    /// tied to attempts: short-circuited reconciles emit nothing.
    async fn attempt<F>(
        &self,
        cluster: &AgentCluster,
        key: &str,
        tenant_uuid: &str,
        install: F,
    ) -> Result<(), ProvisionError>
    where
        F: std::future::Future<Output = Result<bool, ProvisionError>>,
    {
        match install.await {
            Ok(_) => {
                self.events.emit(InstallEvent::installed(
                    cluster.namespace(),
                    cluster.name(),
                    key,
                    tenant_uuid,
                ));
                Ok(())
            }
            Err(err) => {
                self.events.emit(InstallEvent::failed(
                    cluster.namespace(),
                    cluster.name(),
                    key,
                    tenant_uuid,
                ));
                Err(err)
            }
        }
    }

    fn is_already_present(&self, target_dir: &std::path::Path) -> bool {
        self.vfs.exists(target_dir) && !self.resolver.is_init_mount()
    }

    /// Install registry row for a resource. The registry is advisory
    /// bookkeeping and never gates installation.
    pub async fn install_record(
        &self,
        name: &str,
    ) -> Result<Option<InstallRecord>, ProvisionError> {
        Ok(self.registry.lock().await.get_install(name)?)
    }

    /// Best-effort status echo; a write conflict means a newer view of the
    /// resource exists and the next reconcile will publish against it.
    async fn echo_status(&self, cluster: &AgentCluster, key: &str) {
        let mut updated = cluster.clone();
        updated.status.code_modules = Some(CodeModulesStatus {
            version: key.to_string(),
            updated_at: Utc::now(),
        });
        if let Err(err) = self.store.update_agent_cluster_status(&updated).await {
            match err {
                StoreError::Conflict(_) => debug!(
                    resource = %updated.name(),
                    "status update conflict, skipping echo"
                ),
                other => warn!(
                    resource = %updated.name(),
                    error = %other,
                    "status update failed"
                ),
            }
        }
    }
}
