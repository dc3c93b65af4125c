//! Tenant API client.
//!
//! Downloads agent archives and process-module configuration from the
//! tenant's deployment API. Archive downloads stream chunk-by-chunk into a
//! caller-provided sink; nothing is buffered whole. All optional transport
//! concerns (proxy, extra roots, cert-check skip, network zone) arrive
//! through [`TenantClientConfig`] as plain fields.

use std::io::Write;
use std::time::Duration;

use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use skald_procconf::ProcessModuleConfig;

pub const OS_UNIX: &str = "unix";
pub const INSTALLER_TYPE_PAAS: &str = "paas";
pub const FLAVOR_DEFAULT: &str = "default";
pub const ARCH_X86: &str = "x86";
pub const ARCH_ARM: &str = "arm";
pub const TECHNOLOGY_ALL: &str = "all";

const BITNESS_64: &str = "64";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Errors from tenant API operations.
#[derive(Debug, Error)]
pub enum TenantApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response, message taken from the API error envelope
    /// when one is present.
    #[error("tenant api returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid tenant client configuration: {0}")]
    Config(String),
}

/// Agent selector for download endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerProperties {
    pub os: String,
    pub installer_type: String,
    pub flavor: String,
    pub arch: String,
    /// Technology filters; each becomes one repeated `include` parameter.
    pub technologies: Vec<String>,
}

impl Default for InstallerProperties {
    fn default() -> Self {
        InstallerProperties {
            os: OS_UNIX.to_string(),
            installer_type: INSTALLER_TYPE_PAAS.to_string(),
            flavor: FLAVOR_DEFAULT.to_string(),
            arch: default_arch().to_string(),
            technologies: vec![TECHNOLOGY_ALL.to_string()],
        }
    }
}

impl InstallerProperties {
    /// Properties for this host with the given technology filters;
    /// an empty list means all technologies.
    pub fn for_technologies(technologies: &[String]) -> Self {
        let mut props = InstallerProperties::default();
        if !technologies.is_empty() {
            props.technologies = technologies.to_vec();
        }
        props
    }
}

/// Architecture label the deployment API expects for this build target.
pub fn default_arch() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        ARCH_ARM
    } else {
        ARCH_X86
    }
}

/// Connection settings for one tenant.
#[derive(Debug, Clone)]
pub struct TenantClientConfig {
    /// Base URL including the `/api` suffix; trailing slashes are trimmed.
    pub base_url: String,
    /// Token for configuration endpoints.
    pub api_token: String,
    /// Token for installer downloads.
    pub paas_token: String,
    pub network_zone: Option<String>,
    pub host_group: Option<String>,
    pub skip_cert_check: bool,
    /// Extra PEM roots appended to the trust store.
    pub ca_bundle: Option<Vec<u8>>,
    pub proxy_url: Option<String>,
    pub timeout: Duration,
}

impl TenantClientConfig {
    pub fn new(base_url: &str, api_token: &str, paas_token: &str) -> Self {
        TenantClientConfig {
            base_url: base_url.to_string(),
            api_token: api_token.to_string(),
            paas_token: paas_token.to_string(),
            network_zone: None,
            host_group: None,
            skip_cert_check: false,
            ca_bundle: None,
            proxy_url: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Client for the tenant deployment API.
pub struct TenantApiClient {
    config: TenantClientConfig,
    base_url: String,
    client: Client,
}

impl TenantApiClient {
    pub fn new(config: TenantClientConfig) -> Result<Self, TenantApiError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(TenantApiError::Config("empty api url".into()));
        }
        if config.api_token.is_empty() || config.paas_token.is_empty() {
            return Err(TenantApiError::Config("empty token".into()));
        }

        let mut builder = Client::builder().timeout(config.timeout);
        if config.skip_cert_check {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &config.ca_bundle {
            for cert in reqwest::Certificate::from_pem_bundle(pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        if let Some(proxy) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;

        Ok(TenantApiClient {
            config,
            base_url,
            client,
        })
    }

    /// Download the newest published agent into `sink`. Returns bytes written.
    pub async fn get_latest_agent(
        &self,
        props: &InstallerProperties,
        sink: &mut (dyn Write + Send),
    ) -> Result<u64, TenantApiError> {
        let url = format!(
            "{}/v1/deployment/installer/agent/{}/{}/latest",
            self.base_url, props.os, props.installer_type
        );
        debug!(url = %url, "downloading latest agent");

        let request = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, self.paas_auth())
            .query(&self.download_query(props));
        let response = request.send().await?;
        self.stream_to_sink(response, sink).await
    }

    /// Download one exact agent version into `sink`. Returns bytes written.
    pub async fn get_agent(
        &self,
        props: &InstallerProperties,
        version: &str,
        sink: &mut (dyn Write + Send),
    ) -> Result<u64, TenantApiError> {
        let url = format!(
            "{}/v1/deployment/installer/agent/{}/{}/version/{}",
            self.base_url, props.os, props.installer_type, version
        );
        debug!(url = %url, version = %version, "downloading agent");

        let request = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, self.paas_auth())
            .query(&self.download_query(props));
        let response = request.send().await?;
        self.stream_to_sink(response, sink).await
    }

    /// Download from a fully specified installer URL, bypassing version
    /// resolution entirely.
    pub async fn get_agent_via_installer_url(
        &self,
        installer_url: &str,
        sink: &mut (dyn Write + Send),
    ) -> Result<u64, TenantApiError> {
        debug!(url = %installer_url, "downloading agent from explicit url");

        let request = self
            .client
            .get(installer_url)
            .header(header::AUTHORIZATION, self.paas_auth());
        let response = request.send().await?;
        self.stream_to_sink(response, sink).await
    }

    /// Versions the tenant can serve for the given os and installer type.
    pub async fn get_agent_versions(
        &self,
        os: &str,
        installer_type: &str,
    ) -> Result<Vec<String>, TenantApiError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AgentVersions {
            available_versions: Vec<String>,
        }

        let url = format!(
            "{}/v1/deployment/installer/agent/versions/{}/{}",
            self.base_url, os, installer_type
        );
        let props = InstallerProperties::default();
        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, self.paas_auth())
            .query(&[("flavor", props.flavor.as_str()), ("arch", props.arch.as_str())])
            .send()
            .await?;
        let response = self.ensure_success(response).await?;
        let versions: AgentVersions = response.json().await?;
        Ok(versions.available_versions)
    }

    /// Process-module configuration newer than `revision`, or `None` when
    /// the server has nothing newer. `304` is the documented no-change
    /// answer; `404` means the tenant predates the endpoint and is treated
    /// the same way.
    pub async fn get_process_module_config(
        &self,
        revision: u64,
    ) -> Result<Option<ProcessModuleConfig>, TenantApiError> {
        let url = format!(
            "{}/v1/deployment/installer/agent/processmoduleconfig",
            self.base_url
        );
        let mut query: Vec<(&str, String)> = vec![("revision", revision.to_string())];
        if let Some(group) = &self.config.host_group {
            query.push(("hostGroup", group.clone()));
        }

        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, self.api_auth())
            .query(&query)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            _ => Err(self.error_from(response).await),
        }
    }

    fn paas_auth(&self) -> String {
        format!("Api-Token {}", self.config.paas_token)
    }

    fn api_auth(&self) -> String {
        format!("Api-Token {}", self.config.api_token)
    }

    fn download_query(&self, props: &InstallerProperties) -> Vec<(&'static str, String)> {
        let mut query: Vec<(&'static str, String)> = vec![
            ("flavor", props.flavor.clone()),
            ("arch", props.arch.clone()),
            ("bitness", BITNESS_64.to_string()),
            ("skipMetadata", "true".to_string()),
        ];
        for technology in &props.technologies {
            query.push(("include", technology.clone()));
        }
        if let Some(zone) = &self.config.network_zone {
            query.push(("networkZone", zone.clone()));
        }
        query
    }

    async fn stream_to_sink(
        &self,
        response: Response,
        sink: &mut (dyn Write + Send),
    ) -> Result<u64, TenantApiError> {
        let mut response = self.ensure_success(response).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            sink.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        sink.flush()?;
        debug!(bytes = written, "download complete");
        Ok(written)
    }

    async fn ensure_success(&self, response: Response) -> Result<Response, TenantApiError> {
        if response.status().is_success() {
            return Ok(response);
        }
        Err(self.error_from(response).await)
    }

    async fn error_from(&self, response: Response) -> TenantApiError {
        #[derive(Deserialize)]
        struct Envelope {
            error: EnvelopeBody,
        }
        #[derive(Deserialize)]
        struct EnvelopeBody {
            #[serde(default)]
            #[allow(dead_code)]
            code: Option<i64>,
            message: String,
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Envelope>(&body)
            .map(|envelope| envelope.error.message)
            .unwrap_or(body);
        TenantApiError::Api { status, message }
    }
}
