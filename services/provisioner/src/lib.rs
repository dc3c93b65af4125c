//! skald Code-Module Provisioner
//!
//! The provisioner runs on each node with the shared agent volume mounted
//! and converges AgentCluster resources into installed code modules: it
//! downloads the agent from the tenant API or pulls it from an OCI
//! registry, unpacks it into a content-addressed directory, and renders
//! the merged process-module configuration next to it.
//!
//! ## Architecture
//!
//! ```text
//! Provisioner loop
//! ├── ObjectStore        (AgentCluster / Secret / ConfigMap source)
//! ├── TenantApiClient    (installer downloads, process-module config)
//! ├── RegistryClient     (OCI manifest + layer pulls)
//! ├── Extractor          (zip / tar.gz unpack with staging)
//! └── StateStore         (local SQLite install registry)
//! ```
//!
//! ## Modules
//!
//! - `archive`: safe zip and gzipped-tar extraction
//! - `installer`: URL and image install strategies plus the `current` link
//! - `oci`: registry client, references, on-disk image layout
//! - `pmc`: process-module config cache, baseline, merge deployment
//! - `provisioner`: the reconcile loop itself

pub mod archive;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod installer;
pub mod oci;
pub mod pmc;
pub mod provisioner;
pub mod resource;
pub mod state;
pub mod store;
pub mod tenant;
pub mod vfs;

// Re-export commonly used types
pub use error::ProvisionError;
pub use provisioner::{Provisioner, ProvisionerOptions};
pub use resource::AgentCluster;
pub use store::{FileStore, MemoryStore, ObjectStore};
pub use vfs::{MemFs, OsFs, Vfs};
