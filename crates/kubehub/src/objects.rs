//! Objects collector: lists every listable served resource and returns the
//! raw objects.

use anyhow::{Context, Result};
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::TypeMeta;
use kube::discovery::{verbs, Discovery};
use kube::Client;
use tracing::{debug, warn};

use kollect_core::{Config, DataCollector, Record, ResourceKind};

/// High-churn noise kinds that carry no asset signal.
const EXCLUDED_KINDS: &[&str] = &["Event"];
const EXCLUDED_GROUPS: &[&str] = &["events.k8s.io", "metrics.k8s.io"];

const LIST_PAGE_LIMIT: u32 = 500;

pub struct ObjectsCollector {
    client: Client,
}

impl ObjectsCollector {
    pub fn new(client: Client) -> ObjectsCollector {
        ObjectsCollector { client }
    }
}

#[async_trait::async_trait]
impl DataCollector for ObjectsCollector {
    fn source(&self) -> &'static str {
        "kubernetes-objects"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Objects
    }

    async fn collect(&self, _conf: &Config) -> Result<Vec<Record>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .context("discovering served resource types")?;

        let mut records = Vec::new();
        for group in discovery.groups() {
            if EXCLUDED_GROUPS.contains(&group.name()) {
                continue;
            }
            for (ar, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) {
                    continue;
                }
                if EXCLUDED_KINDS.contains(&ar.kind.as_str()) {
                    continue;
                }

                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
                let mut params = ListParams::default().limit(LIST_PAGE_LIMIT);
                let mut listed = 0usize;
                loop {
                    let page = match api.list(&params).await {
                        Ok(page) => page,
                        // RBAC gaps and aggregated-API hiccups must not sink
                        // the whole snapshot.
                        Err(err) => {
                            warn!(
                                group = %ar.group,
                                kind = %ar.kind,
                                error = %err,
                                "listing resource failed, skipping it"
                            );
                            break;
                        }
                    };
                    let continue_token = page.metadata.continue_.clone();
                    for mut object in page.items {
                        // List items come without type metadata; restore it
                        // so downstream consumers see apiVersion/kind.
                        object.types = Some(TypeMeta {
                            api_version: ar.api_version.clone(),
                            kind: ar.kind.clone(),
                        });
                        match serde_json::to_value(&object) {
                            Ok(value) => {
                                records.push(value);
                                listed += 1;
                            }
                            Err(err) => {
                                warn!(kind = %ar.kind, error = %err, "serializing object failed")
                            }
                        }
                    }
                    match continue_token {
                        Some(token) if !token.is_empty() => {
                            params.continue_token = Some(token);
                        }
                        _ => break,
                    }
                }
                debug!(group = %ar.group, kind = %ar.kind, listed, "resource listed");
            }
        }
        Ok(records)
    }
}
