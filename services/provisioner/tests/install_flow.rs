//! End-to-end reconcile tests for the install pipeline.
//!
//! These drive `Provisioner::reconcile` against an in-memory object store
//! and filesystem, with wiremock standing in for the tenant deployment API
//! and the container registry.

use std::io::{Cursor, Write};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use sha2::{Digest, Sha256};
use tar::{Builder, Header};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use skald_paths::PathResolver;
use skald_provisioner::events::{EventReason, RecordingSink};
use skald_provisioner::provisioner::DEFAULT_REQUEUE;
use skald_provisioner::resource::{AgentClusterSpec, CodeModulesSpec, ObjectMeta};
use skald_provisioner::state::StateStore;
use skald_provisioner::store::Secret;
use skald_provisioner::{
    AgentCluster, MemFs, MemoryStore, ObjectStore, ProvisionError, Provisioner,
    ProvisionerOptions, Vfs,
};
use skald_reconcile::Outcome;

const TENANT: &str = "abc12345";
const API_PREFIX: &str = "/e/abc12345/api";
const NAMESPACE: &str = "agents";

const BASELINE: &str = "[general]\nstorage /var/lib/oneagent\nloglevel info\n";

struct Harness {
    store: Arc<MemoryStore>,
    fs: Arc<MemFs>,
    events: Arc<RecordingSink>,
    resolver: PathResolver,
    provisioner: Provisioner,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let fs = Arc::new(MemFs::new());
    let events = Arc::new(RecordingSink::new());
    let resolver = PathResolver::new("/data");
    let provisioner = Provisioner::new(
        store.clone(),
        fs.clone(),
        events.clone(),
        resolver.clone(),
        StateStore::open_in_memory().unwrap(),
        ProvisionerOptions::default(),
    );
    Harness { store, fs, events, resolver, provisioner }
}

fn cluster(server: &MockServer, name: &str) -> AgentCluster {
    AgentCluster {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: NAMESPACE.to_string(),
            generation: Some(1),
        },
        spec: AgentClusterSpec {
            api_url: format!("{}{}", server.uri(), API_PREFIX),
            code_modules: CodeModulesSpec { enabled: true, ..Default::default() },
            ..Default::default()
        },
        status: Default::default(),
    }
}

fn secret(name: &str, pairs: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: NAMESPACE.to_string(),
            generation: None,
        },
        data: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn tokens_secret(name: &str) -> Secret {
    secret(name, &[("apiToken", "api-1"), ("paasToken", "paas-1")])
}

fn agent_zip() -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().unix_permissions(0o755);
    writer.start_file("agent/bin/1.2.3.4-56/oneagent", options).unwrap();
    writer.write_all(b"elf").unwrap();
    writer
        .start_file("agent/conf/ruxitagentproc.conf", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(BASELINE.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

async fn mock_pmc(server: &MockServer, revision: &str, template: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(format!(
            "{API_PREFIX}/v1/deployment/installer/agent/processmoduleconfig"
        )))
        .and(query_param("revision", revision))
        .respond_with(template)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_url_install_reconcile_end_to_end() {
    let server = MockServer::start().await;
    mock_pmc(
        &server,
        "0",
        ResponseTemplate::new(200).set_body_json(json!({
            "revision": 3,
            "properties": [
                {"section": "general", "key": "loglevel", "value": "debug"}
            ]
        })),
    )
    .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{API_PREFIX}/v1/deployment/installer/agent/unix/paas/version/1.2.3.4-56"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(agent_zip()))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness();
    let mut resource = cluster(&server, "main");
    resource.spec.code_modules.version = Some("1.2.3.4-56".to_string());
    h.store.put_agent_cluster(resource);
    h.store.put_secret(tokens_secret("main"));

    let outcome = h.provisioner.reconcile(NAMESPACE, "main").await.unwrap();
    assert_eq!(outcome, Outcome::requeue_after(DEFAULT_REQUEUE));

    // Agent unpacked into the version-keyed directory, baseline preserved.
    let target = h.resolver.agent_binary_dir("1.2.3.4-56");
    assert!(h.fs.exists(&target.join("agent/bin/1.2.3.4-56/oneagent")));
    assert_eq!(
        h.fs.read_to_vec(&target.join("agent/conf/_ruxitagentproc.conf")).unwrap(),
        BASELINE.as_bytes()
    );

    // Merged config rendered for the tenant with the server override applied.
    let dest = h
        .resolver
        .agent_config_dir(TENANT)
        .join("agent/conf/ruxitagentproc.conf");
    let merged = String::from_utf8(h.fs.read_to_vec(&dest).unwrap()).unwrap();
    assert!(merged.contains("loglevel debug"), "merged was: {merged}");
    assert!(merged.contains("storage /var/lib/oneagent"));

    // Exactly one success event, naming version and tenant.
    let events = h.events.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, EventReason::InstallAgentVersion);
    assert!(events[0].message.contains("1.2.3.4-56"));
    assert!(events[0].message.contains(TENANT));

    // Status echoed through the object store.
    let stored = h.store.get_agent_cluster(NAMESPACE, "main").await.unwrap();
    assert_eq!(stored.status.code_modules.unwrap().version, "1.2.3.4-56");

    // Install registry row recorded.
    let record = h.provisioner.install_record("main").await.unwrap().unwrap();
    assert_eq!(record.tenant_uuid, TENANT);
    assert_eq!(record.latest_version.as_deref(), Some("1.2.3.4-56"));
    assert!(record.image_digest.is_none());
}

#[tokio::test]
async fn test_second_reconcile_skips_install_but_refreshes_config() {
    let server = MockServer::start().await;
    mock_pmc(
        &server,
        "0",
        ResponseTemplate::new(200).set_body_json(json!({
            "revision": 3,
            "properties": [
                {"section": "general", "key": "loglevel", "value": "debug"}
            ]
        })),
    )
    .await;
    mock_pmc(&server, "3", ResponseTemplate::new(304)).await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{API_PREFIX}/v1/deployment/installer/agent/unix/paas/version/1.2.3.4-56"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(agent_zip()))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness();
    let mut resource = cluster(&server, "main");
    resource.spec.code_modules.version = Some("1.2.3.4-56".to_string());
    h.store.put_agent_cluster(resource);
    h.store.put_secret(tokens_secret("main"));

    h.provisioner.reconcile(NAMESPACE, "main").await.unwrap();
    assert_eq!(h.events.events().len(), 1);
    let first_record = h.provisioner.install_record("main").await.unwrap().unwrap();

    // Drop the rendered config; the next pass must re-render it even
    // though the install itself is skipped.
    let dest = h
        .resolver
        .agent_config_dir(TENANT)
        .join("agent/conf/ruxitagentproc.conf");
    h.fs.remove(&dest).unwrap();

    let outcome = h.provisioner.reconcile(NAMESPACE, "main").await.unwrap();
    assert_eq!(outcome, Outcome::requeue_after(DEFAULT_REQUEUE));

    // No second install attempt, so no second event and no registry touch.
    assert_eq!(h.events.events().len(), 1);
    let second_record = h.provisioner.install_record("main").await.unwrap().unwrap();
    assert_eq!(second_record.updated_at, first_record.updated_at);
    assert!(h.fs.exists(&dest));
}

#[tokio::test]
async fn test_failed_download_emits_failure_event() {
    let server = MockServer::start().await;
    mock_pmc(&server, "0", ResponseTemplate::new(304)).await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{API_PREFIX}/v1/deployment/installer/agent/unix/paas/version/9.9.9.9-9"
        )))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": {"code": 500, "message": "installer backend unavailable"}
        })))
        .mount(&server)
        .await;

    let h = harness();
    let mut resource = cluster(&server, "main");
    resource.spec.code_modules.version = Some("9.9.9.9-9".to_string());
    h.store.put_agent_cluster(resource);
    h.store.put_secret(tokens_secret("main"));

    let err = h.provisioner.reconcile(NAMESPACE, "main").await.unwrap_err();
    assert!(matches!(err, ProvisionError::TenantApi(_)), "got {err}");

    let events = h.events.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, EventReason::FailedInstallAgentVersion);
    assert!(events[0].message.contains("9.9.9.9-9"));

    // Nothing landed: no target, no registry row, no status.
    assert!(!h.fs.exists(&h.resolver.agent_binary_dir("9.9.9.9-9")));
    assert!(h.provisioner.install_record("main").await.unwrap().is_none());
    let stored = h.store.get_agent_cluster(NAMESPACE, "main").await.unwrap();
    assert!(stored.status.code_modules.is_none());
}

// OCI fixtures for the image-mode tests.

fn layer_with(name: &str, body: &[u8], mode: u32) -> Vec<u8> {
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut header = Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder.append_data(&mut header, name, body).unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

struct FakeImage {
    manifest_bytes: Vec<u8>,
    manifest_digest: String,
    config: Vec<u8>,
    config_digest: String,
    layers: Vec<(String, Vec<u8>)>,
}

fn fake_image() -> FakeImage {
    let config = json!({"architecture": "amd64", "os": "linux"}).to_string().into_bytes();
    let config_digest = digest_of(&config);

    let first = layer_with("agent/bin/oneagent", b"elf", 0o755);
    let second = layer_with("agent/conf/ruxitagentproc.conf", BASELINE.as_bytes(), 0o644);
    let layers = vec![(digest_of(&first), first), (digest_of(&second), second)];

    let manifest_bytes = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config.len(),
        },
        "layers": layers
            .iter()
            .map(|(digest, data)| {
                json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": digest,
                    "size": data.len(),
                })
            })
            .collect::<Vec<_>>(),
    })
    .to_string()
    .into_bytes();
    let manifest_digest = digest_of(&manifest_bytes);

    FakeImage { manifest_bytes, manifest_digest, config, config_digest, layers }
}

async fn mount_image(server: &MockServer, image: &FakeImage) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/oneagent/manifests/{}", image.manifest_digest)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/vnd.oci.image.manifest.v1+json")
                .set_body_bytes(image.manifest_bytes.clone()),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/oneagent/blobs/{}", image.config_digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(image.config.clone()))
        .mount(server)
        .await;
    for (digest, data) in &image.layers {
        Mock::given(method("GET"))
            .and(path(format!("/v2/oneagent/blobs/{digest}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_image_install_reconcile_end_to_end() {
    let tenant_server = MockServer::start().await;
    mock_pmc(&tenant_server, "0", ResponseTemplate::new(304)).await;

    let registry_server = MockServer::start().await;
    let image = fake_image();
    mount_image(&registry_server, &image).await;
    let key = image.manifest_digest.trim_start_matches("sha256:").to_string();

    let h = harness();
    let mut resource = cluster(&tenant_server, "main");
    resource.spec.code_modules.image = Some(format!(
        "{}/oneagent@{}",
        registry_server.address(),
        image.manifest_digest
    ));
    h.store.put_agent_cluster(resource);
    h.store.put_secret(tokens_secret("main"));
    h.store.put_secret(secret("main-pull-secret", &[(".dockerconfigjson", r#"{"auths":{}}"#)]));

    let outcome = h.provisioner.reconcile(NAMESPACE, "main").await.unwrap();
    assert_eq!(outcome, Outcome::requeue_after(DEFAULT_REQUEUE));

    // Layers unpacked into the digest-keyed directory; no layout cache left.
    let target = h.resolver.agent_binary_dir(&key);
    assert_eq!(h.fs.read_to_vec(&target.join("agent/bin/oneagent")).unwrap(), b"elf");
    assert!(h.fs.exists(&target.join("agent/conf/ruxitagentproc.conf")));
    assert!(!h.fs.exists(&h.resolver.image_cache_dir(&key)));
    // Digest targets carry no current link.
    assert!(!h.fs.exists(&target.join("current")));

    // Merged config rendered even though the server had nothing newer.
    let dest = h
        .resolver
        .agent_config_dir(TENANT)
        .join("agent/conf/ruxitagentproc.conf");
    assert_eq!(h.fs.read_to_vec(&dest).unwrap(), BASELINE.as_bytes());

    let events = h.events.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, EventReason::InstallAgentVersion);
    assert!(events[0].message.contains(&key));

    let stored = h.store.get_agent_cluster(NAMESPACE, "main").await.unwrap();
    assert_eq!(stored.status.code_modules.unwrap().version, key);

    let record = h.provisioner.install_record("main").await.unwrap().unwrap();
    assert_eq!(record.image_digest.as_deref(), Some(image.manifest_digest.as_str()));
    assert!(record.latest_version.is_none());
}

#[tokio::test]
async fn test_image_already_present_skips_pull_and_events() {
    let tenant_server = MockServer::start().await;
    mock_pmc(&tenant_server, "0", ResponseTemplate::new(304)).await;

    let registry_server = MockServer::start().await;
    let image = fake_image();
    let key = image.manifest_digest.trim_start_matches("sha256:").to_string();

    let h = harness();
    let mut resource = cluster(&tenant_server, "main");
    resource.spec.code_modules.image = Some(format!(
        "{}/oneagent@{}",
        registry_server.address(),
        image.manifest_digest
    ));
    h.store.put_agent_cluster(resource);
    h.store.put_secret(tokens_secret("main"));
    // No pull secret: the short-circuit must fire before credentials are read.

    // Seed the target as a previous reconcile would have left it.
    let target = h.resolver.agent_binary_dir(&key);
    let conf = target.join("agent/conf/ruxitagentproc.conf");
    h.fs.mkdir_all(conf.parent().unwrap(), 0o755).unwrap();
    let mut writer = h.fs.create(&conf, 0o666).unwrap();
    writer.write_all(BASELINE.as_bytes()).unwrap();
    drop(writer);

    let outcome = h.provisioner.reconcile(NAMESPACE, "main").await.unwrap();
    assert_eq!(outcome, Outcome::requeue_after(DEFAULT_REQUEUE));

    // No registry traffic, no events, no registry row; status still echoed.
    assert!(registry_server.received_requests().await.unwrap().is_empty());
    assert!(h.events.events().is_empty());
    assert!(h.provisioner.install_record("main").await.unwrap().is_none());
    let stored = h.store.get_agent_cluster(NAMESPACE, "main").await.unwrap();
    assert_eq!(stored.status.code_modules.unwrap().version, key);
}
