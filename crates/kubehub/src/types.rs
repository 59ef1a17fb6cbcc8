//! Type-metadata collector: the set of served resource types (incl. CRDs).

use anyhow::{Context, Result};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use kollect_core::{Config, DataCollector, Record, ResourceKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

pub struct TypesCollector {
    client: Client,
}

impl TypesCollector {
    pub fn new(client: Client) -> TypesCollector {
        TypesCollector { client }
    }
}

#[async_trait::async_trait]
impl DataCollector for TypesCollector {
    fn source(&self) -> &'static str {
        "kubernetes-types"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Types
    }

    async fn collect(&self, _conf: &Config) -> Result<Vec<Record>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .context("discovering served resource types")?;

        let mut resources = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                resources.push(DiscoveredResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                });
            }
        }
        // Stable order across runs
        resources.sort_by(|a, b| {
            a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind))
        });
        debug!(types = resources.len(), "resource types discovered");

        resources
            .into_iter()
            .map(|r| serde_json::to_value(r).context("serializing discovered resource"))
            .collect()
    }
}
