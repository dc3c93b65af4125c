//! AgentCluster resource model.
//!
//! The provisioner consumes `AgentCluster` objects from the object store and
//! writes back only `status.codeModules`. Everything else on the object is
//! owned by other operator components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// Identity of a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
}

/// Proxy configuration, inline or referenced from a secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySource {
    /// Proxy URL given directly in the resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Name of a secret whose `proxy` key holds the URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

/// Code-module installation knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeModulesSpec {
    /// Gate for the whole install pipeline. When false the reconciler
    /// requeues on the long interval without touching the filesystem.
    pub enabled: bool,
    /// Version for URL-based installation; `latest` is a valid sentinel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Digest-pinned OCI reference; takes precedence over `version`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Full download URL overriding version resolution entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installer_url: Option<String>,
    /// Code-module technologies to include; empty means all.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub technologies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentClusterSpec {
    /// Tenant API base URL, e.g. `https://abc12345.live.example.com/api`.
    pub api_url: String,
    /// Secret holding `apiToken` / `paasToken`; defaults to the resource name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<String>,
    /// Secret holding `.dockerconfigjson`; defaults to `<name>-pull-secret`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_pull_secret: Option<String>,
    /// ConfigMap whose `certs` key carries extra PEM roots.
    #[serde(rename = "trustedCAs", skip_serializing_if = "Option::is_none")]
    pub trusted_cas: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_group: Option<String>,
    pub skip_cert_check: bool,
    pub code_modules: CodeModulesSpec,
}

/// Install state written back after a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeModulesStatus {
    /// Version string or image digest that was installed.
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentClusterStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_modules: Option<CodeModulesStatus>,
}

/// An AgentCluster custom resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCluster {
    pub metadata: ObjectMeta,
    pub spec: AgentClusterSpec,
    pub status: AgentClusterStatus,
}

impl AgentCluster {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Whether agent code modules should be provisioned at all.
    pub fn needs_injection(&self) -> bool {
        self.spec.code_modules.enabled
    }

    /// Name of the secret carrying the tenant tokens.
    pub fn tokens_name(&self) -> String {
        self.spec
            .tokens
            .clone()
            .unwrap_or_else(|| self.metadata.name.clone())
    }

    /// Name of the secret carrying registry pull credentials.
    pub fn pull_secret_name(&self) -> String {
        self.spec
            .custom_pull_secret
            .clone()
            .unwrap_or_else(|| format!("{}-pull-secret", self.metadata.name))
    }

    /// Short tenant identifier derived from the API URL.
    ///
    /// Managed deployments expose the tenant under an `/e/<uuid>/api` path;
    /// SaaS tenants are the first label of the hostname.
    pub fn tenant_uuid(&self) -> Result<String, ProvisionError> {
        tenant_uuid_from_api_url(&self.spec.api_url)
    }
}

/// Derive the tenant UUID from a tenant API base URL.
pub fn tenant_uuid_from_api_url(api_url: &str) -> Result<String, ProvisionError> {
    let parsed = reqwest::Url::parse(api_url).map_err(|err| {
        ProvisionError::Internal(format!("parse api url {api_url:?}: {err}"))
    })?;

    let segments: Vec<&str> = parsed
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    if segments.len() >= 3 && segments[0] == "e" && segments[2] == "api" {
        return Ok(segments[1].to_string());
    }

    let label = parsed
        .host_str()
        .unwrap_or_default()
        .split('.')
        .find(|part| !part.is_empty())
        .unwrap_or_default();
    if label.is_empty() {
        return Err(ProvisionError::Internal(format!(
            "no tenant uuid derivable from api url {api_url:?}"
        )));
    }
    Ok(label.to_string())
}
