//! skald Code-Module Provisioner
//!
//! Node-local daemon that watches AgentCluster manifests and keeps the
//! shared agent volume converged: code modules installed under
//! content-addressed directories and per-tenant process-module
//! configuration rendered next to them.

use std::sync::Arc;

use anyhow::{Context, Result};
use skald_paths::PathResolver;
use skald_provisioner::events::LogSink;
use skald_provisioner::state::StateStore;
use skald_provisioner::{config, FileStore, OsFs, Provisioner, ProvisionerOptions, Vfs};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = config::Settings::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SKALD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting skald code-module provisioner");
    info!(
        root_dir = %settings.root_dir,
        manifest_dir = %settings.manifest_dir,
        namespace = settings.namespace.as_deref().unwrap_or("<all>"),
        "Configuration loaded"
    );

    let resolver = PathResolver::new(&settings.root_dir);
    let fs: Arc<dyn Vfs> = Arc::new(OsFs::new());
    fs.mkdir_all(resolver.root_dir(), 0o755)
        .with_context(|| format!("creating data root {}", settings.root_dir))?;

    let registry = StateStore::open(resolver.state_db_path())
        .context("opening local install registry")?;
    let store = Arc::new(FileStore::new(&settings.manifest_dir));
    let events = Arc::new(LogSink);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let provisioner = Provisioner::new(
        store,
        fs,
        events,
        resolver,
        registry,
        ProvisionerOptions {
            namespace: settings.namespace.clone(),
            sync_interval: std::time::Duration::from_secs(settings.sync_interval_secs),
        },
    );
    let loop_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            provisioner.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = loop_handle => {
            info!("Provisioning loop exited");
        }
    }

    // Signal shutdown to the loop
    let _ = shutdown_tx.send(true);

    // Give the loop time to finish the in-flight reconcile
    info!("Waiting for the provisioning loop to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Provisioner shutdown complete");
    Ok(())
}
