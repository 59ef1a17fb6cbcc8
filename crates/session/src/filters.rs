//! Default post-processing filters over the collected resource set.

use kollect_core::{DataFilter, ResourceKind, ResourceSet};
use tracing::debug;

const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Drops `metadata.managedFields` from collected objects; the server-side
/// apply bookkeeping dwarfs the object itself and carries no signal.
pub struct StripManagedFields;

#[async_trait::async_trait]
impl DataFilter for StripManagedFields {
    fn name(&self) -> &'static str {
        "strip-managed-fields"
    }

    async fn apply(&self, set: &mut ResourceSet) -> anyhow::Result<()> {
        let mut stripped = 0usize;
        if let Some(objects) = set.get_mut(ResourceKind::Objects) {
            for object in objects.iter_mut() {
                if let Some(meta) = object.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    if meta.remove("managedFields").is_some() {
                        stripped += 1;
                    }
                }
            }
        }
        debug!(stripped, "managed fields removed");
        Ok(())
    }
}

/// Drops the `last-applied-configuration` annotation; it embeds a full copy
/// of the object, doubling page weight and duplicating secret material.
pub struct StripLastApplied;

#[async_trait::async_trait]
impl DataFilter for StripLastApplied {
    fn name(&self) -> &'static str {
        "strip-last-applied"
    }

    async fn apply(&self, set: &mut ResourceSet) -> anyhow::Result<()> {
        let mut stripped = 0usize;
        if let Some(objects) = set.get_mut(ResourceKind::Objects) {
            for object in objects.iter_mut() {
                let annotations = object
                    .get_mut("metadata")
                    .and_then(|m| m.get_mut("annotations"))
                    .and_then(|a| a.as_object_mut());
                if let Some(annotations) = annotations {
                    if annotations.remove(LAST_APPLIED_ANNOTATION).is_some() {
                        stripped += 1;
                    }
                }
            }
        }
        debug!(stripped, "last-applied annotations removed");
        Ok(())
    }
}

/// The filters every session runs unless the caller overrides the registry.
pub fn default_filters() -> Vec<Box<dyn DataFilter>> {
    vec![Box::new(StripManagedFields), Box::new(StripLastApplied)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn managed_fields_are_stripped() {
        let mut set = ResourceSet::new();
        set.insert(
            ResourceKind::Objects,
            vec![json!({
                "kind": "Pod",
                "metadata": { "name": "p", "managedFields": [{"manager": "kubectl"}] }
            })],
        );
        StripManagedFields.apply(&mut set).await.unwrap();
        assert!(set.get(ResourceKind::Objects)[0]["metadata"].get("managedFields").is_none());
    }

    #[tokio::test]
    async fn last_applied_annotation_is_stripped() {
        let mut set = ResourceSet::new();
        set.insert(
            ResourceKind::Objects,
            vec![json!({
                "kind": "Pod",
                "metadata": {
                    "name": "p",
                    "annotations": {
                        "kubectl.kubernetes.io/last-applied-configuration": "{\"kind\":\"Pod\"}",
                        "team": "payments"
                    }
                }
            })],
        );
        StripLastApplied.apply(&mut set).await.unwrap();
        let annotations = &set.get(ResourceKind::Objects)[0]["metadata"]["annotations"];
        assert!(annotations.get(LAST_APPLIED_ANNOTATION).is_none());
        assert_eq!(annotations["team"], "payments");
    }

    #[tokio::test]
    async fn filters_ignore_other_kinds() {
        let mut set = ResourceSet::new();
        set.insert(ResourceKind::HelmReleases, vec![json!({"name": "db"})]);
        StripManagedFields.apply(&mut set).await.unwrap();
        assert_eq!(set.get(ResourceKind::HelmReleases).len(), 1);
    }
}
