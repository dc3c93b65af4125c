//! Wire and cache types for the process-module configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Section holding host-level properties.
pub const GENERAL_SECTION: &str = "general";

/// Property key carrying the resource's host group.
pub const HOST_GROUP_KEY: &str = "hostGroup";

/// Overrides grouped by section, ordered for deterministic output.
pub type ConfMap = BTreeMap<String, BTreeMap<String, String>>;

/// One `(section, key, value)` override as served by the tenant API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfProperty {
    pub section: String,
    pub key: String,
    pub value: String,
}

/// Revisioned process-module configuration.
///
/// The revision is monotonic per tenant; the server only returns a body
/// when it holds a newer revision than the one presented by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessModuleConfig {
    pub revision: u64,
    #[serde(default)]
    pub properties: Vec<ConfProperty>,
}

impl ProcessModuleConfig {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Group the properties by section. Later duplicates win, matching
    /// server behaviour where the newest value for a key is last.
    pub fn to_map(&self) -> ConfMap {
        let mut map = ConfMap::new();
        for prop in &self.properties {
            map.entry(prop.section.clone())
                .or_default()
                .insert(prop.key.clone(), prop.value.clone());
        }
        map
    }

    /// Insert or replace a property.
    pub fn add_property(&mut self, section: &str, key: &str, value: &str) {
        for prop in &mut self.properties {
            if prop.section == section && prop.key == key {
                prop.value = value.to_string();
                return;
            }
        }
        self.properties.push(ConfProperty {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    /// Remove a property if present.
    pub fn remove_property(&mut self, section: &str, key: &str) {
        self.properties
            .retain(|prop| !(prop.section == section && prop.key == key));
    }

    /// Upsert the `[general] hostGroup` property. An empty host group
    /// removes a previously configured value.
    pub fn add_host_group(&mut self, host_group: &str) {
        if host_group.is_empty() {
            self.remove_property(GENERAL_SECTION, HOST_GROUP_KEY);
        } else {
            self.add_property(GENERAL_SECTION, HOST_GROUP_KEY, host_group);
        }
    }
}

/// On-disk cache entry: the server config plus the hash handed to
/// downstream consumers. Serialized as the config object with an added
/// `hash` field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedProcessModuleConfig {
    #[serde(flatten)]
    pub config: ProcessModuleConfig,
    pub hash: String,
}

impl CachedProcessModuleConfig {
    /// Cache entry for a freshly fetched config. The hash is the decimal
    /// revision; consumers only compare it for change detection.
    pub fn new(config: ProcessModuleConfig) -> Self {
        let hash = config.revision.to_string();
        Self { config, hash }
    }
}
