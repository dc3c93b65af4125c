//! Object store access.
//!
//! The provisioner never talks to an API server directly; it reads
//! `AgentCluster`, `Secret`, and `ConfigMap` objects through [`ObjectStore`]
//! and writes back exactly one thing, the code-modules status. [`MemoryStore`]
//! backs tests and can inject a status-write conflict. [`FileStore`] serves
//! the standalone binary from a directory of JSON manifests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::{AgentCluster, ObjectMeta};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Another writer updated the object since it was read.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store backend: {0}")]
    Backend(String),
}

/// Opaque credential object. Values are plain strings; binary payloads
/// (CA bundles, docker config JSON) are carried verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Secret {
    pub metadata: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_agent_cluster(&self, namespace: &str, name: &str)
        -> Result<AgentCluster, StoreError>;

    /// All AgentCluster objects, optionally narrowed to one namespace.
    async fn list_agent_clusters(&self, namespace: Option<&str>)
        -> Result<Vec<AgentCluster>, StoreError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError>;

    /// Replace `status` on the stored object with the one on `cluster`.
    async fn update_agent_cluster_status(&self, cluster: &AgentCluster) -> Result<(), StoreError>;
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

#[derive(Default)]
struct MemoryInner {
    clusters: BTreeMap<String, AgentCluster>,
    secrets: BTreeMap<String, Secret>,
    config_maps: BTreeMap<String, ConfigMap>,
    fail_next_status_update: bool,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn put_agent_cluster(&self, cluster: AgentCluster) {
        let key = object_key(cluster.namespace(), cluster.name());
        self.lock().clusters.insert(key, cluster);
    }

    pub fn remove_agent_cluster(&self, namespace: &str, name: &str) {
        self.lock().clusters.remove(&object_key(namespace, name));
    }

    pub fn put_secret(&self, secret: Secret) {
        let key = object_key(&secret.metadata.namespace, &secret.metadata.name);
        self.lock().secrets.insert(key, secret);
    }

    pub fn put_config_map(&self, config_map: ConfigMap) {
        let key = object_key(&config_map.metadata.namespace, &config_map.metadata.name);
        self.lock().config_maps.insert(key, config_map);
    }

    /// Make the next status update fail with [`StoreError::Conflict`].
    pub fn fail_next_status_update(&self) {
        self.lock().fail_next_status_update = true;
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_agent_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AgentCluster, StoreError> {
        self.lock()
            .clusters
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("agentcluster {namespace}/{name}")))
    }

    async fn list_agent_clusters(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<AgentCluster>, StoreError> {
        Ok(self
            .lock()
            .clusters
            .values()
            .filter(|cluster| namespace.is_none_or(|ns| cluster.namespace() == ns))
            .cloned()
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError> {
        self.lock()
            .secrets
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("secret {namespace}/{name}")))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError> {
        self.lock()
            .config_maps
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("configmap {namespace}/{name}")))
    }

    async fn update_agent_cluster_status(
        &self,
        cluster: &AgentCluster,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_next_status_update {
            inner.fail_next_status_update = false;
            return Err(StoreError::Conflict(format!(
                "agentcluster {}/{} changed since read",
                cluster.namespace(),
                cluster.name()
            )));
        }
        let key = object_key(cluster.namespace(), cluster.name());
        match inner.clusters.get_mut(&key) {
            Some(stored) => {
                stored.status = cluster.status.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("agentcluster {key}"))),
        }
    }
}

/// Manifest-directory store used by the standalone binary.
///
/// Layout: `<dir>/agentclusters/<namespace>/<name>.json` and the same shape
/// under `secrets/` and `configmaps/`. Status updates rewrite the manifest
/// in place through a temp file; with a single writer there is no conflict
/// path here.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn manifest_path(&self, kind_dir: &str, namespace: &str, name: &str) -> PathBuf {
        self.root
            .join(kind_dir)
            .join(namespace)
            .join(format!("{name}.json"))
    }

    fn read_manifest<T: serde::de::DeserializeOwned>(
        &self,
        kind_dir: &str,
        namespace: &str,
        name: &str,
    ) -> Result<T, StoreError> {
        let path = self.manifest_path(kind_dir, namespace, name);
        let raw = std::fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(format!("{kind_dir} {namespace}/{name}"))
            } else {
                StoreError::Backend(format!("read {}: {err}", path.display()))
            }
        })?;
        serde_json::from_slice(&raw)
            .map_err(|err| StoreError::Backend(format!("decode {}: {err}", path.display())))
    }

    fn namespaces_under(&self, kind_dir: &str) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.root.join(kind_dir);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StoreError::Backend(format!("read {}: {err}", dir.display())))
            }
        };
        let mut dirs = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| StoreError::Backend(format!("read {}: {err}", dir.display())))?;
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn clusters_in(&self, namespace_dir: &Path) -> Result<Vec<AgentCluster>, StoreError> {
        let entries = std::fs::read_dir(namespace_dir).map_err(|err| {
            StoreError::Backend(format!("read {}: {err}", namespace_dir.display()))
        })?;
        let mut clusters = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                StoreError::Backend(format!("read {}: {err}", namespace_dir.display()))
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read(&path)
                .map_err(|err| StoreError::Backend(format!("read {}: {err}", path.display())))?;
            let cluster: AgentCluster = serde_json::from_slice(&raw).map_err(|err| {
                StoreError::Backend(format!("decode {}: {err}", path.display()))
            })?;
            clusters.push(cluster);
        }
        clusters.sort_by(|a, b| {
            (a.namespace(), a.name()).cmp(&(b.namespace(), b.name()))
        });
        Ok(clusters)
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn get_agent_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<AgentCluster, StoreError> {
        self.read_manifest("agentclusters", namespace, name)
    }

    async fn list_agent_clusters(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<AgentCluster>, StoreError> {
        let mut clusters = Vec::new();
        match namespace {
            Some(ns) => {
                let dir = self.root.join("agentclusters").join(ns);
                if dir.is_dir() {
                    clusters.extend(self.clusters_in(&dir)?);
                }
            }
            None => {
                for dir in self.namespaces_under("agentclusters")? {
                    clusters.extend(self.clusters_in(&dir)?);
                }
            }
        }
        Ok(clusters)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError> {
        self.read_manifest("secrets", namespace, name)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError> {
        self.read_manifest("configmaps", namespace, name)
    }

    async fn update_agent_cluster_status(
        &self,
        cluster: &AgentCluster,
    ) -> Result<(), StoreError> {
        let mut stored = self
            .get_agent_cluster(cluster.namespace(), cluster.name())
            .await?;
        stored.status = cluster.status.clone();

        let path = self.manifest_path("agentclusters", cluster.namespace(), cluster.name());
        let raw = serde_json::to_vec_pretty(&stored)
            .map_err(|err| StoreError::Backend(format!("encode {}: {err}", path.display())))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .map_err(|err| StoreError::Backend(format!("write {}: {err}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|err| StoreError::Backend(format!("rename {}: {err}", path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{AgentClusterStatus, CodeModulesStatus};

    fn sample_cluster(name: &str) -> AgentCluster {
        AgentCluster {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: "skald".into(),
                generation: Some(1),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_memory_store_get_and_list() {
        let store = MemoryStore::new();
        store.put_agent_cluster(sample_cluster("a"));
        store.put_agent_cluster(sample_cluster("b"));

        let got = store.get_agent_cluster("skald", "a").await.unwrap();
        assert_eq!(got.name(), "a");

        let all = store.list_agent_clusters(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let none = store.list_agent_clusters(Some("other")).await.unwrap();
        assert!(none.is_empty());

        let err = store.get_agent_cluster("skald", "missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_memory_store_status_update_and_conflict() {
        let store = MemoryStore::new();
        store.put_agent_cluster(sample_cluster("a"));

        let mut updated = sample_cluster("a");
        updated.status = AgentClusterStatus {
            code_modules: Some(CodeModulesStatus {
                version: "1.2.3.4-5".into(),
                updated_at: chrono::Utc::now(),
            }),
        };

        store.fail_next_status_update();
        let err = store.update_agent_cluster_status(&updated).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store.update_agent_cluster_status(&updated).await.unwrap();
        let stored = store.get_agent_cluster("skald", "a").await.unwrap();
        assert_eq!(
            stored.status.code_modules.unwrap().version,
            "1.2.3.4-5"
        );
    }

    #[tokio::test]
    async fn test_file_store_reads_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_dir = dir.path().join("agentclusters/skald");
        std::fs::create_dir_all(&cluster_dir).unwrap();
        std::fs::write(
            cluster_dir.join("demo.json"),
            serde_json::to_vec_pretty(&sample_cluster("demo")).unwrap(),
        )
        .unwrap();

        let secret_dir = dir.path().join("secrets/skald");
        std::fs::create_dir_all(&secret_dir).unwrap();
        let secret = Secret {
            metadata: ObjectMeta {
                name: "demo".into(),
                namespace: "skald".into(),
                generation: None,
            },
            data: BTreeMap::from([("apiToken".to_string(), "t0ken".to_string())]),
        };
        std::fs::write(
            secret_dir.join("demo.json"),
            serde_json::to_vec_pretty(&secret).unwrap(),
        )
        .unwrap();

        let store = FileStore::new(dir.path());
        let cluster = store.get_agent_cluster("skald", "demo").await.unwrap();
        assert_eq!(cluster.name(), "demo");

        let listed = store.list_agent_clusters(None).await.unwrap();
        assert_eq!(listed.len(), 1);

        let secret = store.get_secret("skald", "demo").await.unwrap();
        assert_eq!(secret.data["apiToken"], "t0ken");

        assert!(matches!(
            store.get_config_map("skald", "missing").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_file_store_status_update_rewrites_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_dir = dir.path().join("agentclusters/skald");
        std::fs::create_dir_all(&cluster_dir).unwrap();
        std::fs::write(
            cluster_dir.join("demo.json"),
            serde_json::to_vec_pretty(&sample_cluster("demo")).unwrap(),
        )
        .unwrap();

        let store = FileStore::new(dir.path());
        let mut cluster = store.get_agent_cluster("skald", "demo").await.unwrap();
        cluster.status = AgentClusterStatus {
            code_modules: Some(CodeModulesStatus {
                version: "sha256-abc".into(),
                updated_at: chrono::Utc::now(),
            }),
        };
        store.update_agent_cluster_status(&cluster).await.unwrap();

        let reread = store.get_agent_cluster("skald", "demo").await.unwrap();
        assert_eq!(reread.status.code_modules.unwrap().version, "sha256-abc");
    }
}
