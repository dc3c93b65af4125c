//! Credential resolution.
//!
//! Reads the secrets and config maps an `AgentCluster` references and turns
//! them into typed credentials for the tenant and registry clients. A
//! referenced-but-missing object is a [`ProvisionError::CredentialMissing`],
//! not a plain not-found: the resource asked for it, so provisioning cannot
//! proceed without it.

use std::collections::BTreeMap;

use base64::Engine;
use serde::Deserialize;

use crate::error::ProvisionError;
use crate::resource::AgentCluster;
use crate::store::{ObjectStore, StoreError};

/// Key in a pull secret carrying docker-style registry credentials.
pub const PULL_SECRET_KEY: &str = ".dockerconfigjson";
/// Key in a trusted-CA config map carrying the PEM bundle.
pub const TRUSTED_CAS_KEY: &str = "certs";
/// Key in a proxy secret carrying the proxy URL.
pub const PROXY_KEY: &str = "proxy";

const API_TOKEN_KEY: &str = "apiToken";
const PAAS_TOKEN_KEY: &str = "paasToken";
const TENANT_TOKEN_KEY: &str = "tenantToken";

/// Tenant API tokens with the PaaS fallback already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tokens {
    pub api_token: String,
    /// Download-scope token; equals `api_token` when the secret has none.
    pub paas_token: String,
    pub tenant_token: Option<String>,
}

fn missing_as_credential(err: StoreError) -> ProvisionError {
    match err {
        StoreError::NotFound(what) => ProvisionError::CredentialMissing(what),
        other => other.into(),
    }
}

fn required(
    data: &BTreeMap<String, String>,
    key: &str,
    what: &str,
) -> Result<String, ProvisionError> {
    match data.get(key) {
        Some(value) if !value.trim().is_empty() => Ok(value.clone()),
        _ => Err(ProvisionError::CredentialMissing(format!("{key} in {what}"))),
    }
}

fn optional(data: &BTreeMap<String, String>, key: &str) -> Option<String> {
    data.get(key)
        .filter(|value| !value.trim().is_empty())
        .cloned()
}

/// Read the tenant tokens referenced by the cluster.
pub async fn read_tokens(
    store: &dyn ObjectStore,
    cluster: &AgentCluster,
) -> Result<Tokens, ProvisionError> {
    let name = cluster.tokens_name();
    let secret = store
        .get_secret(cluster.namespace(), &name)
        .await
        .map_err(missing_as_credential)?;
    let what = format!("secret {}/{name}", cluster.namespace());

    let api_token = required(&secret.data, API_TOKEN_KEY, &what)?;
    let paas_token = optional(&secret.data, PAAS_TOKEN_KEY).unwrap_or_else(|| api_token.clone());
    let tenant_token = optional(&secret.data, TENANT_TOKEN_KEY);

    Ok(Tokens {
        api_token,
        paas_token,
        tenant_token,
    })
}

/// Read and parse the registry pull secret referenced by the cluster.
pub async fn read_pull_secret(
    store: &dyn ObjectStore,
    cluster: &AgentCluster,
) -> Result<DockerKeychain, ProvisionError> {
    let name = cluster.pull_secret_name();
    let secret = store
        .get_secret(cluster.namespace(), &name)
        .await
        .map_err(missing_as_credential)?;
    let what = format!("secret {}/{name}", cluster.namespace());
    let raw = required(&secret.data, PULL_SECRET_KEY, &what)?;
    DockerKeychain::parse(&raw)
}

/// Read the extra PEM roots referenced by the cluster, if any.
pub async fn read_trusted_cas(
    store: &dyn ObjectStore,
    cluster: &AgentCluster,
) -> Result<Option<Vec<u8>>, ProvisionError> {
    let Some(name) = cluster.spec.trusted_cas.as_deref() else {
        return Ok(None);
    };
    let config_map = store
        .get_config_map(cluster.namespace(), name)
        .await
        .map_err(missing_as_credential)?;
    let what = format!("configmap {}/{name}", cluster.namespace());
    let pem = required(&config_map.data, TRUSTED_CAS_KEY, &what)?;
    Ok(Some(pem.into_bytes()))
}

/// Resolve the proxy URL, inline value first, secret reference second.
pub async fn read_proxy_url(
    store: &dyn ObjectStore,
    cluster: &AgentCluster,
) -> Result<Option<String>, ProvisionError> {
    let Some(proxy) = cluster.spec.proxy.as_ref() else {
        return Ok(None);
    };
    if let Some(value) = proxy.value.as_deref() {
        if !value.trim().is_empty() {
            return Ok(Some(value.to_string()));
        }
    }
    let Some(name) = proxy.value_from.as_deref() else {
        return Ok(None);
    };
    let secret = store
        .get_secret(cluster.namespace(), name)
        .await
        .map_err(missing_as_credential)?;
    let what = format!("secret {}/{name}", cluster.namespace());
    Ok(Some(required(&secret.data, PROXY_KEY, &what)?))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    /// Base64 `user:password`, the legacy combined form.
    #[serde(default)]
    auth: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
}

/// Username and password for one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Parsed `.dockerconfigjson`, queried per registry host.
#[derive(Debug, Clone, Default)]
pub struct DockerKeychain {
    auths: BTreeMap<String, RegistryAuth>,
}

impl DockerKeychain {
    pub fn parse(raw: &str) -> Result<Self, ProvisionError> {
        let config: DockerConfig = serde_json::from_str(raw).map_err(|err| {
            ProvisionError::CredentialMissing(format!("unparseable {PULL_SECRET_KEY}: {err}"))
        })?;

        let mut auths = BTreeMap::new();
        for (key, entry) in config.auths {
            let Some(auth) = entry_auth(&entry)? else {
                continue;
            };
            auths.insert(normalize_registry_key(&key), auth);
        }
        Ok(DockerKeychain { auths })
    }

    /// Credentials for a registry host, or `None` for anonymous access.
    ///
    /// Docker Hub pulls hit `registry-1.docker.io` while configs commonly
    /// key the entry as `https://index.docker.io/v1/` or `docker.io`; all
    /// three resolve to the same entry.
    pub fn auth_for(&self, host: &str) -> Option<RegistryAuth> {
        if let Some(auth) = self.auths.get(host) {
            return Some(auth.clone());
        }
        if matches!(host, "registry-1.docker.io" | "index.docker.io" | "docker.io") {
            for alias in ["registry-1.docker.io", "index.docker.io", "docker.io"] {
                if let Some(auth) = self.auths.get(alias) {
                    return Some(auth.clone());
                }
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }
}

fn entry_auth(entry: &DockerAuthEntry) -> Result<Option<RegistryAuth>, ProvisionError> {
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        if !username.is_empty() {
            return Ok(Some(RegistryAuth {
                username: username.clone(),
                password: password.clone(),
            }));
        }
    }
    if let Some(combined) = &entry.auth {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(combined.trim())
            .map_err(|err| {
                ProvisionError::CredentialMissing(format!("bad auth field in pull secret: {err}"))
            })?;
        let decoded = String::from_utf8(decoded).map_err(|err| {
            ProvisionError::CredentialMissing(format!("bad auth field in pull secret: {err}"))
        })?;
        if let Some((username, password)) = decoded.split_once(':') {
            return Ok(Some(RegistryAuth {
                username: username.to_string(),
                password: password.to_string(),
            }));
        }
        return Err(ProvisionError::CredentialMissing(
            "auth field in pull secret lacks user:password form".into(),
        ));
    }
    Ok(None)
}

fn normalize_registry_key(key: &str) -> String {
    let stripped = key
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let stripped = stripped.strip_suffix('/').unwrap_or(stripped);
    let stripped = stripped.strip_suffix("/v1").unwrap_or(stripped);
    stripped.to_string()
}
