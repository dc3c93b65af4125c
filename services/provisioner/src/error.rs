//! Error taxonomy for the provisioning core.
//!
//! Every fallible operation in this crate funnels into [`ProvisionError`].
//! The reconcile loop keys its requeue and event decisions off the variant,
//! so classification here is behavior, not decoration: a `NotFound` ends the
//! work item quietly, a `Conflict` on status write is swallowed, and
//! everything else is logged, emitted as a failure event where an install
//! was attempted, and retried with backoff.

use thiserror::Error;

use crate::oci::OciError;
use crate::state::StateStoreError;
use crate::store::StoreError;
use crate::tenant::TenantApiError;

/// Error surfaced by provisioning operations.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A referenced object (cluster, secret, config map) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A required credential field is absent or empty.
    #[error("credential missing: {0}")]
    CredentialMissing(String),

    /// The tenant API rejected a call or could not be reached.
    #[error(transparent)]
    TenantApi(#[from] TenantApiError),

    /// The container registry rejected a call or served bad content.
    #[error(transparent)]
    Registry(#[from] OciError),

    /// An agent archive is malformed or violates extraction policy.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// A concurrent writer updated the object first.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The on-disk config cache could not be decoded.
    #[error("corrupt config cache: {0}")]
    CacheCorrupt(String),

    /// Filesystem failure outside the dedicated classifications above.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation inside the provisioner itself.
    #[error("internal: {0}")]
    Internal(String),
}

impl ProvisionError {
    /// True when the condition clears by waiting for an external writer,
    /// not by retrying harder.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ProvisionError::Conflict(_))
    }
}

impl From<StoreError> for ProvisionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ProvisionError::NotFound(what),
            StoreError::Conflict(what) => ProvisionError::Conflict(what),
            StoreError::Backend(msg) => ProvisionError::Internal(msg),
        }
    }
}

impl From<StateStoreError> for ProvisionError {
    fn from(err: StateStoreError) -> Self {
        ProvisionError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ProvisionError {
    fn from(err: serde_json::Error) -> Self {
        ProvisionError::Internal(format!("json: {err}"))
    }
}
