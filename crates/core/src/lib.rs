//! Kollect core – resource model, collector/filter contracts, config and
//! chunking shared by every other crate.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod chunk;
pub mod config;

pub use chunk::{paginate, ChunkStats, Page, MAX_ITEM_SIZE};
pub use config::Config;

/// Opaque record as collected from the cluster. The upload pipeline never
/// looks inside; it only serializes.
pub type Record = serde_json::Value;

/// Named category of collected data. Typed inside the process, rendered to
/// its stable wire key only at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Objects,
    HelmReleases,
    Types,
    Trees,
}

impl ResourceKind {
    pub fn key(&self) -> &'static str {
        match self {
            ResourceKind::Objects => "k8s_objects",
            ResourceKind::HelmReleases => "helm_releases",
            ResourceKind::Types => "k8s_types",
            ResourceKind::Trees => "k8s_trees",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Everything one session collected, keyed by kind. Owned exclusively by
/// the session for the run's duration; filters mutate it in place.
#[derive(Debug, Default)]
pub struct ResourceSet {
    entries: BTreeMap<ResourceKind, Vec<Record>>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace (or create) the records for a kind.
    pub fn insert(&mut self, kind: ResourceKind, records: Vec<Record>) {
        self.entries.insert(kind, records);
    }

    pub fn get(&self, kind: ResourceKind) -> &[Record] {
        self.entries.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get_mut(&mut self, kind: ResourceKind) -> Option<&mut Vec<Record>> {
        self.entries.get_mut(&kind)
    }

    /// Remove and return a kind's records; missing kinds yield an empty vec.
    pub fn take(&mut self, kind: ResourceKind) -> Vec<Record> {
        self.entries.remove(&kind).unwrap_or_default()
    }

    pub fn len(&self, kind: ResourceKind) -> usize {
        self.get(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    /// Render the whole set as one JSON document keyed by wire keys
    /// (dry-run output).
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (kind, records) in &self.entries {
            map.insert(kind.key().to_string(), serde_json::Value::Array(records.clone()));
        }
        serde_json::Value::Object(map)
    }
}

/// A pluggable data source. Implementations enumerate one kind of cluster
/// data; the session runs them in registration order.
#[async_trait::async_trait]
pub trait DataCollector: Send + Sync {
    /// Stable name for logs and error messages.
    fn source(&self) -> &'static str;

    /// The kind this collector populates. Known up front so the session can
    /// classify failures even when `collect` errors.
    fn kind(&self) -> ResourceKind;

    async fn collect(&self, conf: &Config) -> anyhow::Result<Vec<Record>>;
}

/// A post-processing step over the aggregated set. Filters are advisory:
/// the session logs a failing filter and moves on.
#[async_trait::async_trait]
pub trait DataFilter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, set: &mut ResourceSet) -> anyhow::Result<()>;
}

/// Derives the stable unique id of the live cluster, used by the backend to
/// detect reused configurations.
#[async_trait::async_trait]
pub trait ClusterIdentity: Send + Sync {
    async fn unique_cluster_id(&self) -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_keys_are_stable() {
        assert_eq!(ResourceKind::Objects.key(), "k8s_objects");
        assert_eq!(ResourceKind::HelmReleases.key(), "helm_releases");
        assert_eq!(ResourceKind::Types.key(), "k8s_types");
        assert_eq!(ResourceKind::Trees.key(), "k8s_trees");
    }

    #[test]
    fn take_on_missing_kind_is_empty() {
        let mut set = ResourceSet::new();
        assert!(set.take(ResourceKind::Trees).is_empty());
        set.insert(ResourceKind::Objects, vec![serde_json::json!({"a": 1})]);
        assert_eq!(set.take(ResourceKind::Objects).len(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn to_json_uses_wire_keys() {
        let mut set = ResourceSet::new();
        set.insert(ResourceKind::HelmReleases, vec![serde_json::json!({"name": "db"})]);
        let doc = set.to_json();
        assert!(doc.get("helm_releases").is_some());
        assert!(doc.get("HelmReleases").is_none());
    }
}
